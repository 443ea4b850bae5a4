//! Typed features and the locations where they were observed.
//!
//! A `Feature` is an immutable observation produced by an extractor backend
//! (an import name, a string, an API call, a numeric constant, ...). The
//! engine never mutates features; it only indexes them into a `FeatureSet`
//! per scope instance and queries them while evaluating rule logic.

use std::collections::BTreeSet;
use std::fmt;

use regex::Regex;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tracing::warn;

use crate::config::MAX_REGEX_SIZE;

/// Where a feature was observed.
///
/// Static backends report virtual addresses; dynamic backends report
/// coordinates into a recorded execution trace. Equality defines "same
/// occurrence" and the `Ord` impl fixes the deterministic report order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Location {
    /// Whole-sample observation with no narrower address.
    File,
    /// Static virtual address.
    Absolute { address: u64 },
    /// A process in a recorded trace, keyed by (pid, ppid).
    Process { pid: u32, ppid: u32 },
    /// A thread within a traced process.
    Thread { pid: u32, ppid: u32, tid: u32 },
    /// A single API call within a traced thread.
    Call { pid: u32, ppid: u32, tid: u32, call_id: u32 },
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::File => write!(f, "file"),
            Location::Absolute { address } => write!(f, "{address:#x}"),
            Location::Process { pid, ppid } => write!(f, "process=({pid}:{ppid})"),
            Location::Thread { pid, ppid, tid } => {
                write!(f, "process=({pid}:{ppid}),thread={tid}")
            }
            Location::Call { pid, ppid, tid, call_id } => {
                write!(f, "process=({pid}:{ppid}),thread={tid},call={call_id}")
            }
        }
    }
}

/// Discriminant of a feature, used for scope compatibility checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeatureKind {
    Import,
    Export,
    Section,
    FunctionName,
    String,
    Substring,
    Regex,
    Api,
    Number,
    Mnemonic,
    Characteristic,
    Os,
    Arch,
    Format,
    MatchedRule,
}

impl fmt::Display for FeatureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FeatureKind::Import => "import",
            FeatureKind::Export => "export",
            FeatureKind::Section => "section",
            FeatureKind::FunctionName => "function-name",
            FeatureKind::String => "string",
            FeatureKind::Substring => "substring",
            FeatureKind::Regex => "regex",
            FeatureKind::Api => "api",
            FeatureKind::Number => "number",
            FeatureKind::Mnemonic => "mnemonic",
            FeatureKind::Characteristic => "characteristic",
            FeatureKind::Os => "os",
            FeatureKind::Arch => "arch",
            FeatureKind::Format => "format",
            FeatureKind::MatchedRule => "match",
        };
        write!(f, "{name}")
    }
}

/// A typed observation, or the predicate form that queries one.
///
/// `Substring` and `Regex` only appear as predicates inside rule logic; they
/// match against the `String` features of a set rather than being extracted
/// themselves. `MatchedRule` is synthetic: the engine injects it when a rule
/// matches, which is what makes rule-to-rule references a plain lookup.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Feature {
    Import(String),
    Export(String),
    Section(String),
    FunctionName(String),
    String(String),
    Substring(String),
    Regex(String),
    Api(String),
    Number(i128),
    Mnemonic(String),
    Characteristic(String),
    Os(String),
    Arch(String),
    Format(String),
    MatchedRule(String),
}

impl Feature {
    pub fn kind(&self) -> FeatureKind {
        match self {
            Feature::Import(_) => FeatureKind::Import,
            Feature::Export(_) => FeatureKind::Export,
            Feature::Section(_) => FeatureKind::Section,
            Feature::FunctionName(_) => FeatureKind::FunctionName,
            Feature::String(_) => FeatureKind::String,
            Feature::Substring(_) => FeatureKind::Substring,
            Feature::Regex(_) => FeatureKind::Regex,
            Feature::Api(_) => FeatureKind::Api,
            Feature::Number(_) => FeatureKind::Number,
            Feature::Mnemonic(_) => FeatureKind::Mnemonic,
            Feature::Characteristic(_) => FeatureKind::Characteristic,
            Feature::Os(_) => FeatureKind::Os,
            Feature::Arch(_) => FeatureKind::Arch,
            Feature::Format(_) => FeatureKind::Format,
            Feature::MatchedRule(_) => FeatureKind::MatchedRule,
        }
    }

    /// True for the predicate-only forms that scan string features.
    pub fn is_pattern(&self) -> bool {
        matches!(self, Feature::Substring(_) | Feature::Regex(_))
    }

    fn value_str(&self) -> String {
        match self {
            Feature::Number(n) => n.to_string(),
            Feature::Import(v)
            | Feature::Export(v)
            | Feature::Section(v)
            | Feature::FunctionName(v)
            | Feature::String(v)
            | Feature::Substring(v)
            | Feature::Regex(v)
            | Feature::Api(v)
            | Feature::Mnemonic(v)
            | Feature::Characteristic(v)
            | Feature::Os(v)
            | Feature::Arch(v)
            | Feature::Format(v)
            | Feature::MatchedRule(v) => v.clone(),
        }
    }

    /// The `kind(value)` form used inside count expressions.
    pub fn compact(&self) -> String {
        format!("{}({})", self.kind(), self.value_str())
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind(), self.value_str())
    }
}

/// Split a `/pattern/` or `/pattern/i` token into (pattern, case_insensitive).
pub(crate) fn regex_token_parts(token: &str) -> Option<(&str, bool)> {
    let token = token.strip_prefix('/')?;
    if let Some(pattern) = token.strip_suffix("/i") {
        Some((pattern, true))
    } else {
        token.strip_suffix('/').map(|pattern| (pattern, false))
    }
}

/// Compiled regex predicates, built once per rule set.
///
/// A pattern that fails to compile is kept as `None`: that one predicate
/// is unsatisfiable at evaluation time and the rest of the run proceeds.
#[derive(Debug, Default)]
pub struct PatternIndex {
    compiled: FxHashMap<String, Option<Regex>>,
}

impl PatternIndex {
    pub fn insert(&mut self, token: &str) {
        if self.compiled.contains_key(token) {
            return;
        }
        let compiled = regex_token_parts(token).and_then(|(pattern, insensitive)| {
            // Unanchored search semantics, bounded compiled size so no
            // predicate can blow up a run.
            regex::RegexBuilder::new(pattern)
                .case_insensitive(insensitive)
                .size_limit(MAX_REGEX_SIZE)
                .build()
                .map_err(|e| warn!(token, error = %e, "malformed regex predicate"))
                .ok()
        });
        self.compiled.insert(token.to_string(), compiled);
    }

    pub fn get(&self, token: &str) -> Option<&Regex> {
        self.compiled.get(token).and_then(|re| re.as_ref())
    }
}

/// The features visible at one scope instance, indexed by value with every
/// witness location retained.
#[derive(Default, Clone)]
pub struct FeatureSet {
    features: FxHashMap<Feature, BTreeSet<Location>>,
}

impl FeatureSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, feature: Feature, location: Location) {
        self.features.entry(feature).or_default().insert(location);
    }

    /// Merge every feature of `other` into this set, keeping all witnesses.
    pub fn extend(&mut self, other: &FeatureSet) {
        for (feature, locations) in &other.features {
            self.features
                .entry(feature.clone())
                .or_default()
                .extend(locations.iter().copied());
        }
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Witness locations for a predicate, or an empty set when unsatisfied.
    ///
    /// Exact predicates are a single index lookup. `Substring` and `Regex`
    /// predicates scan the string-valued features and aggregate every
    /// matching occurrence.
    pub fn witnesses(&self, predicate: &Feature, patterns: &PatternIndex) -> BTreeSet<Location> {
        match predicate {
            Feature::Substring(needle) => self.scan_strings(|value| value.contains(needle)),
            Feature::Regex(token) => match patterns.get(token) {
                Some(re) => self.scan_strings(|value| re.is_match(value)),
                None => BTreeSet::new(),
            },
            exact => self.features.get(exact).cloned().unwrap_or_default(),
        }
    }

    /// Number of distinct occurrences matching a predicate.
    pub fn count(&self, predicate: &Feature, patterns: &PatternIndex) -> usize {
        self.witnesses(predicate, patterns).len()
    }

    fn scan_strings(&self, accept: impl Fn(&str) -> bool) -> BTreeSet<Location> {
        let mut witnesses = BTreeSet::new();
        for (feature, locations) in &self.features {
            if let Feature::String(value) = feature {
                if accept(value) {
                    witnesses.extend(locations.iter().copied());
                }
            }
        }
        witnesses
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(call_id: u32) -> Location {
        Location::Call { pid: 2176, ppid: 0, tid: 7, call_id }
    }

    #[test]
    fn test_exact_lookup() {
        let mut set = FeatureSet::new();
        set.add(Feature::Api("GetAddrInfoW".into()), call(2361));
        let patterns = PatternIndex::default();

        let hits = set.witnesses(&Feature::Api("GetAddrInfoW".into()), &patterns);
        assert_eq!(hits, BTreeSet::from([call(2361)]));
        assert!(set.witnesses(&Feature::Api("DoesNotExist".into()), &patterns).is_empty());
    }

    #[test]
    fn test_witnesses_accumulate_per_value() {
        let mut set = FeatureSet::new();
        for id in [2361, 2365, 2401] {
            set.add(Feature::Api("GetAddrInfoW".into()), call(id));
        }
        let patterns = PatternIndex::default();
        assert_eq!(set.count(&Feature::Api("GetAddrInfoW".into()), &patterns), 3);
    }

    #[test]
    fn test_substring_scans_strings_only() {
        let mut set = FeatureSet::new();
        set.add(Feature::String("raw.githubusercontent.com".into()), call(10323));
        set.add(Feature::Api("githubusercontent".into()), call(1));
        let patterns = PatternIndex::default();

        let hits = set.witnesses(&Feature::Substring("githubusercontent".into()), &patterns);
        assert_eq!(hits, BTreeSet::from([call(10323)]));
    }

    #[test]
    fn test_regex_predicate() {
        let mut set = FeatureSet::new();
        set.add(Feature::String("http://evil.example".into()), call(5));
        set.add(Feature::String("HTTPS://other".into()), call(6));

        let mut patterns = PatternIndex::default();
        patterns.insert("/^http:/");
        patterns.insert("/^https:/i");

        assert_eq!(
            set.witnesses(&Feature::Regex("/^http:/".into()), &patterns),
            BTreeSet::from([call(5)])
        );
        assert_eq!(
            set.witnesses(&Feature::Regex("/^https:/i".into()), &patterns),
            BTreeSet::from([call(6)])
        );
    }

    #[test]
    fn test_malformed_regex_fails_closed() {
        let mut set = FeatureSet::new();
        set.add(Feature::String("anything".into()), call(1));

        let mut patterns = PatternIndex::default();
        patterns.insert("/[unclosed/");

        assert!(set.witnesses(&Feature::Regex("/[unclosed/".into()), &patterns).is_empty());
    }

    #[test]
    fn test_location_ordering_is_stable() {
        let a = Location::Thread { pid: 2176, ppid: 0, tid: 7 };
        let b = call(2358);
        let c = call(2361);
        assert!(a < b && b < c);
        assert_eq!(c.to_string(), "process=(2176:0),thread=7,call=2361");
    }

    #[test]
    fn test_regex_token_parts() {
        assert_eq!(regex_token_parts("/abc/"), Some(("abc", false)));
        assert_eq!(regex_token_parts("/abc/i"), Some(("abc", true)));
        assert_eq!(regex_token_parts("abc"), None);
    }
}
