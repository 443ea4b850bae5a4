//! Report-ready match result trees.
//!
//! The evaluator produces one `MatchResult` per satisfied (rule, scope
//! instance) pair; `ResultDocument::build` assembles them into the
//! file-rooted shape consumed by external renderers. Nothing here contains
//! matching logic, only structural assembly.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::Serialize;

use crate::features::Location;
use crate::ruleset::RuleSet;
use crate::scopes::Scope;

/// Verdict and witnesses for one logic node, mirroring the rule's AST.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeResult {
    pub label: String,
    pub satisfied: bool,
    /// Locations that caused this node's verdict. For a negated node this is
    /// the instance's own location: absence is scope-wide.
    pub locations: BTreeSet<Location>,
    pub children: Vec<NodeResult>,
}

/// A rule's evaluation outcome at one scope instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    pub rule: String,
    pub location: Location,
    pub satisfied: bool,
    pub node: NodeResult,
}

/// All the places one rule matched, with its reporting metadata.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleMatches {
    pub name: String,
    pub namespace: String,
    pub scope: Scope,
    pub authors: Vec<String>,
    pub references: Vec<String>,
    pub description: Option<String>,
    /// Sorted by location for reproducible output.
    pub matches: Vec<MatchResult>,
}

/// The file-rooted report: every rule that matched anywhere, annotated with
/// every scope instance and witness location where it did.
#[derive(Debug, Clone, Serialize)]
pub struct ResultDocument {
    pub analyzed_at: DateTime<Utc>,
    /// Number of (rule, scope instance) evaluations the sweep performed.
    pub rules_evaluated: usize,
    pub instances_evaluated: usize,
    /// True when the per-sample deadline cut evaluation short; the document
    /// then holds whatever partial results existed.
    pub timed_out: bool,
    pub rules: Vec<RuleMatches>,
}

impl ResultDocument {
    pub fn build(
        rule_set: &RuleSet,
        matches: Vec<MatchResult>,
        rules_evaluated: usize,
        instances_evaluated: usize,
        timed_out: bool,
    ) -> Self {
        let mut grouped: FxHashMap<String, Vec<MatchResult>> = FxHashMap::default();
        for result in matches {
            grouped.entry(result.rule.clone()).or_default().push(result);
        }

        let mut rules: Vec<RuleMatches> = grouped
            .into_iter()
            .filter_map(|(name, mut matched)| {
                let rule = rule_set.by_name(&name)?;
                matched.sort_by(|a, b| a.location.cmp(&b.location));
                Some(RuleMatches {
                    name: rule.name.clone(),
                    namespace: rule.namespace.clone(),
                    scope: rule.scope,
                    authors: rule.meta.authors.clone(),
                    references: rule.meta.references.clone(),
                    description: rule.meta.description.clone(),
                    matches: matched,
                })
            })
            .collect();
        rules.sort_by(|a, b| a.name.cmp(&b.name));

        Self {
            analyzed_at: Utc::now(),
            rules_evaluated,
            instances_evaluated,
            timed_out,
            rules,
        }
    }

    /// Serialize the document for external renderers.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Lookup of one rule's matches by name.
    pub fn rule(&self, name: &str) -> Option<&RuleMatches> {
        self.rules.iter().find(|r| r.name == name)
    }

    /// All locations a rule matched at, across every scope instance.
    pub fn locations(&self, name: &str) -> BTreeSet<Location> {
        self.rule(name)
            .map(|r| r.matches.iter().map(|m| m.location).collect())
            .unwrap_or_default()
    }
}
