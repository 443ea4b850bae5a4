//! The rule corpus: loading, indexing, and dependency resolution.
//!
//! A `RuleSet` is built once per analysis run and immutable afterwards. At
//! construction it rejects duplicate rule names, resolves every rule
//! reference (by exact name or namespace prefix), verifies reference scope
//! compatibility, and computes a global topological evaluation order. A rule
//! set with an unresolvable reference or a reference cycle is unusable as a
//! whole, because no evaluation order exists.

use std::collections::BTreeSet;
use std::path::Path;

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::config::MAX_RULE_FILE_SIZE;
use crate::error::{DiscernError, Result};
use crate::features::{Feature, PatternIndex};
use crate::rules::{parse_rule, Rule};
use crate::scopes::Scope;

/// Stable index of a rule within its set.
pub type RuleId = usize;

#[derive(Debug)]
pub struct RuleSet {
    rules: Vec<Rule>,
    by_name: FxHashMap<String, RuleId>,
    /// Every namespace prefix to the rules at or below it.
    by_namespace: FxHashMap<String, Vec<RuleId>>,
    /// Global dependency-topological order: referenced rules come first.
    order: Vec<RuleId>,
    /// Topological order restricted to each scope.
    by_scope: FxHashMap<Scope, Vec<RuleId>>,
    /// Regex predicates compiled once, shared by all evaluations.
    patterns: PatternIndex,
}

impl RuleSet {
    /// Build a rule set from already-parsed rules.
    pub fn from_rules(rules: Vec<Rule>) -> Result<Self> {
        let mut by_name: FxHashMap<String, RuleId> = FxHashMap::default();
        let mut by_namespace: FxHashMap<String, Vec<RuleId>> = FxHashMap::default();

        for (id, rule) in rules.iter().enumerate() {
            if let Some(&first) = by_name.get(&rule.name) {
                return Err(DiscernError::duplicate_rule(
                    &rule.name,
                    &rules[first].source_name,
                ));
            }
            by_name.insert(rule.name.clone(), id);
            for prefix in rule.namespace_prefixes() {
                by_namespace.entry(prefix.to_string()).or_default().push(id);
            }
        }

        let dependencies = resolve_dependencies(&rules, &by_name, &by_namespace)?;
        let order = topological_order(&rules, &dependencies)?;

        let mut by_scope: FxHashMap<Scope, Vec<RuleId>> = FxHashMap::default();
        for &id in &order {
            by_scope.entry(rules[id].scope).or_default().push(id);
        }

        let mut patterns = PatternIndex::default();
        let mut features = Vec::new();
        for rule in &rules {
            rule.logic.collect_features(&mut features);
        }
        for feature in features {
            if let Feature::Regex(token) = feature {
                patterns.insert(token);
            }
        }

        Ok(Self { rules, by_name, by_namespace, order, by_scope, patterns })
    }

    /// Load every `.yml`/`.yaml` rule under a directory tree.
    ///
    /// A file that fails to parse is reported and skipped so the rest of the
    /// corpus still loads; graph-level failures abort the whole load.
    pub fn from_directory<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_dir() {
            return Err(DiscernError::RuleDirectoryNotFound { path: path.to_path_buf() });
        }

        let mut rules = Vec::new();
        let mut skipped = 0usize;
        for entry in WalkDir::new(path)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            let file = entry.path();
            match file.extension().and_then(|e| e.to_str()) {
                Some("yml") | Some("yaml") => {}
                _ => continue,
            }
            if entry.metadata().map(|m| m.len()).unwrap_or(0) > MAX_RULE_FILE_SIZE {
                warn!(path = %file.display(), "rule file exceeds size limit, skipped");
                skipped += 1;
                continue;
            }
            let text = std::fs::read_to_string(file)?;
            match parse_rule(&file.display().to_string(), &text) {
                Ok(rule) => rules.push(rule),
                Err(e) => {
                    warn!(path = %file.display(), error = %e, "skipping malformed rule");
                    skipped += 1;
                }
            }
        }

        info!(loaded = rules.len(), skipped, dir = %path.display(), "loaded rule corpus");
        Self::from_rules(rules)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rule(&self, id: RuleId) -> &Rule {
        &self.rules[id]
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn by_name(&self, name: &str) -> Option<&Rule> {
        self.by_name.get(name).map(|&id| &self.rules[id])
    }

    /// Rules below a namespace prefix.
    pub fn in_namespace(&self, namespace: &str) -> impl Iterator<Item = &Rule> {
        self.by_namespace
            .get(namespace)
            .map(|ids| ids.as_slice())
            .unwrap_or(&[])
            .iter()
            .map(|&id| &self.rules[id])
    }

    /// Global topological order over every rule.
    pub fn evaluation_order(&self) -> &[RuleId] {
        &self.order
    }

    /// Topological order restricted to one scope.
    pub fn rules_for_scope(&self, scope: Scope) -> &[RuleId] {
        self.by_scope.get(&scope).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn patterns(&self) -> &PatternIndex {
        &self.patterns
    }
}

/// Edges `rule -> rules it references`, with scope compatibility enforced:
/// a referenced rule may only fire at a scope the referrer contains.
fn resolve_dependencies(
    rules: &[Rule],
    by_name: &FxHashMap<String, RuleId>,
    by_namespace: &FxHashMap<String, Vec<RuleId>>,
) -> Result<Vec<Vec<RuleId>>> {
    let mut dependencies = Vec::with_capacity(rules.len());
    for rule in rules {
        let mut targets: BTreeSet<RuleId> = BTreeSet::new();
        for reference in rule.references() {
            // A reference can be one rule's name and another's namespace at
            // the same time; the match lookup sees every injected feature,
            // so the edge set has to cover both resolutions.
            let mut resolved = false;
            if let Some(&id) = by_name.get(reference) {
                targets.insert(id);
                resolved = true;
            }
            if let Some(ids) = by_namespace.get(reference) {
                targets.extend(ids.iter().copied());
                resolved = true;
            }
            if !resolved {
                return Err(DiscernError::unresolved_reference(&rule.name, reference));
            }
        }
        for &target in &targets {
            if !rule.scope.contains(rules[target].scope) {
                return Err(DiscernError::scope_mismatch(
                    &rule.name,
                    format!("match: {}", rules[target].name),
                    rule.scope.to_string(),
                ));
            }
        }
        dependencies.push(targets.into_iter().collect());
    }
    Ok(dependencies)
}

/// Kahn's algorithm with a name-ordered ready set for determinism. When no
/// full order exists, a concrete cycle is extracted for the error message.
fn topological_order(rules: &[Rule], dependencies: &[Vec<RuleId>]) -> Result<Vec<RuleId>> {
    let mut in_degree: Vec<usize> = dependencies.iter().map(Vec::len).collect();
    let mut dependents: Vec<Vec<RuleId>> = vec![Vec::new(); rules.len()];
    for (id, deps) in dependencies.iter().enumerate() {
        for &dep in deps {
            dependents[dep].push(id);
        }
    }

    let mut ready: BTreeSet<(&str, RuleId)> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, &deg)| deg == 0)
        .map(|(id, _)| (rules[id].name.as_str(), id))
        .collect();

    let mut order = Vec::with_capacity(rules.len());
    while let Some((_, id)) = ready.pop_first() {
        order.push(id);
        for &dependent in &dependents[id] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                ready.insert((rules[dependent].name.as_str(), dependent));
            }
        }
    }

    if order.len() == rules.len() {
        Ok(order)
    } else {
        Err(DiscernError::cyclic_dependency(extract_cycle(rules, dependencies)))
    }
}

/// Depth-first search for one concrete reference cycle, by rule name.
fn extract_cycle(rules: &[Rule], dependencies: &[Vec<RuleId>]) -> Vec<String> {
    let mut visiting = FxHashSet::default();
    let mut done = FxHashSet::default();
    let mut stack = Vec::new();

    fn visit(
        id: RuleId,
        dependencies: &[Vec<RuleId>],
        visiting: &mut FxHashSet<RuleId>,
        done: &mut FxHashSet<RuleId>,
        stack: &mut Vec<RuleId>,
    ) -> Option<Vec<RuleId>> {
        if done.contains(&id) {
            return None;
        }
        if visiting.contains(&id) {
            let start = stack.iter().position(|&s| s == id).unwrap_or(0);
            return Some(stack[start..].to_vec());
        }
        visiting.insert(id);
        stack.push(id);
        for &dep in &dependencies[id] {
            if let Some(cycle) = visit(dep, dependencies, visiting, done, stack) {
                return Some(cycle);
            }
        }
        stack.pop();
        visiting.remove(&id);
        done.insert(id);
        None
    }

    for id in 0..rules.len() {
        if let Some(cycle) = visit(id, dependencies, &mut visiting, &mut done, &mut stack) {
            return cycle.into_iter().map(|id| rules[id].name.clone()).collect();
        }
    }
    Vec::new()
}
