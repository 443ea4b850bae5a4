//! Bottom-up, memoized rule evaluation.
//!
//! The sweep order is fixed by three constraints: children of a boolean node
//! are evaluated before the node; every scope instance at one level finishes
//! before its parent level starts (feature promotion feeds upward); and rules
//! are visited in dependency-topological order so every referenced rule's
//! verdict already exists as an injected `MatchedRule` feature when its
//! referrer runs. Independent scope instances have no ordering constraint
//! between them and are evaluated on the rayon pool.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;

use dashmap::DashMap;
use rayon::prelude::*;
use tracing::{debug, warn};

use crate::config::EvaluationLimits;
use crate::error::Result;
use crate::extractor::{FeatureExtractor, InstanceHandle};
use crate::features::{Feature, FeatureSet, Location};
use crate::result::{MatchResult, NodeResult, ResultDocument};
use crate::rules::Node;
use crate::ruleset::{RuleId, RuleSet};
use crate::scopes::Scope;

/// Evaluate a rule set against one extractor backend.
///
/// Deterministic for a fixed rule set and feature stream, including under
/// parallel evaluation. Always produces a document; a deadline overrun
/// yields the partial tree with `timed_out` set.
pub fn match_extractor(
    rules: &RuleSet,
    extractor: &dyn FeatureExtractor,
    limits: &EvaluationLimits,
) -> Result<ResultDocument> {
    Evaluator::new(rules, limits.clone()).evaluate(extractor)
}

pub struct Evaluator<'a> {
    rules: &'a RuleSet,
    limits: EvaluationLimits,
}

/// Shared read-mostly evaluation state. The memo table is the only structure
/// written concurrently; insertion is synchronized per key, reads after a
/// key is populated are lock-free.
struct EvalContext<'a> {
    rules: &'a RuleSet,
    /// Keys are the (rule, instance) pairs already evaluated. A verdict
    /// needs no payload: a satisfied rule is visible as its injected
    /// `MatchedRule` feature.
    memo: DashMap<(RuleId, Location), ()>,
    deadline: Option<Instant>,
    timed_out: AtomicBool,
    instances: AtomicUsize,
}

impl EvalContext<'_> {
    /// True once the per-sample budget is exhausted; sticky thereafter.
    fn expired(&self) -> bool {
        if self.timed_out.load(Ordering::Relaxed) {
            return true;
        }
        match self.deadline {
            Some(deadline) if Instant::now() > deadline => {
                self.timed_out.store(true, Ordering::Relaxed);
                true
            }
            _ => false,
        }
    }
}

/// One scope instance with its features and child instances, pulled from
/// the backend before evaluation starts. All extraction (which may block)
/// happens while building this tree; the evaluation sweep itself does no
/// I/O.
struct InstanceNode {
    handle: InstanceHandle,
    features: Vec<(Feature, Location)>,
    children: Vec<InstanceNode>,
    /// Extraction failed here: no rule is evaluated at this instance. Its
    /// children still evaluate and promote normally.
    failed: bool,
}

/// What one evaluated subtree hands to its parent scope instance.
struct InstanceOutcome {
    /// The instance's own features plus everything promoted from its
    /// descendants, matched-rule features included.
    promoted: FeatureSet,
    /// Satisfied match results from the whole subtree.
    matches: Vec<MatchResult>,
}

impl InstanceOutcome {
    fn empty() -> Self {
        Self { promoted: FeatureSet::new(), matches: Vec::new() }
    }
}

/// Partition the feature stream by scope instance, preserving the hierarchy.
///
/// A backend failure for one instance is reported and the instance is
/// marked failed, so no rule fires there; its children and the rest of the
/// run proceed.
fn collect_instance(extractor: &dyn FeatureExtractor, handle: InstanceHandle) -> InstanceNode {
    let (features, failed) = match extractor.features(&handle) {
        Ok(features) => (features, false),
        Err(e) => {
            warn!(at = %handle.location, error = %e, "feature extraction failed, instance skipped");
            (Vec::new(), true)
        }
    };
    let children = match extractor.children(&handle) {
        Ok(children) => children,
        Err(e) => {
            warn!(at = %handle.location, error = %e, "failed to enumerate child instances");
            Vec::new()
        }
    };
    InstanceNode {
        handle,
        features,
        children: children
            .into_iter()
            .map(|child| collect_instance(extractor, child))
            .collect(),
        failed,
    }
}

impl<'a> Evaluator<'a> {
    pub fn new(rules: &'a RuleSet, limits: EvaluationLimits) -> Self {
        Self { rules, limits }
    }

    pub fn evaluate(&self, extractor: &dyn FeatureExtractor) -> Result<ResultDocument> {
        let ctx = EvalContext {
            rules: self.rules,
            memo: DashMap::new(),
            deadline: self.limits.timeout.map(|t| Instant::now() + t),
            timed_out: AtomicBool::new(false),
            instances: AtomicUsize::new(0),
        };

        let roots = match extractor.roots() {
            Ok(roots) => roots,
            Err(e) => {
                warn!(error = %e, "backend failed to enumerate root instances");
                Vec::new()
            }
        };
        let forest: Vec<InstanceNode> = roots
            .into_iter()
            .map(|root| collect_instance(extractor, root))
            .collect();
        debug!(roots = forest.len(), axis = ?extractor.axis(), "starting sweep");

        let outcomes: Vec<InstanceOutcome> = if self.limits.parallel {
            forest
                .into_par_iter()
                .map(|root| self.evaluate_instance(&ctx, root))
                .collect()
        } else {
            forest
                .into_iter()
                .map(|root| self.evaluate_instance(&ctx, root))
                .collect()
        };

        // File scope sees its own features plus every matched rule promoted
        // from both axes; raw sub-file features stay below.
        let mut matches = Vec::new();
        let mut file_set = FeatureSet::new();
        match extractor.file_features() {
            Ok(features) => {
                for (feature, location) in features {
                    file_set.add(feature, location);
                }
            }
            Err(e) => warn!(error = %e, "backend failed to produce file features"),
        }
        for outcome in outcomes {
            for result in &outcome.matches {
                inject_match(self.rules, &mut file_set, &result.rule, result.location);
            }
            matches.extend(outcome.matches);
        }

        ctx.instances.fetch_add(1, Ordering::Relaxed);
        self.evaluate_scope_rules(&ctx, Scope::File, Location::File, &mut file_set, &mut matches);

        let timed_out = ctx.timed_out.load(Ordering::Relaxed);
        if timed_out {
            warn!("evaluation deadline exceeded, returning partial results");
        }
        Ok(ResultDocument::build(
            self.rules,
            matches,
            ctx.memo.len(),
            ctx.instances.load(Ordering::Relaxed),
            timed_out,
        ))
    }

    /// Post-order evaluation of one scope instance: children first, then
    /// this instance's rules against the promoted feature set.
    fn evaluate_instance(&self, ctx: &EvalContext<'_>, instance: InstanceNode) -> InstanceOutcome {
        if ctx.expired() {
            return InstanceOutcome::empty();
        }

        let InstanceNode { handle, features, children, failed } = instance;
        let child_outcomes: Vec<InstanceOutcome> = if self.limits.parallel {
            children
                .into_par_iter()
                .map(|child| self.evaluate_instance(ctx, child))
                .collect()
        } else {
            children
                .into_iter()
                .map(|child| self.evaluate_instance(ctx, child))
                .collect()
        };

        let mut set = FeatureSet::new();
        for (feature, location) in features {
            set.add(feature, location);
        }

        let mut matches = Vec::new();
        for outcome in child_outcomes {
            set.extend(&outcome.promoted);
            matches.extend(outcome.matches);
        }

        // A failed instance only relays what its children promoted; a rule
        // must not fire against a feature set the backend never produced
        // (a negation would trivially hold there).
        if !failed {
            ctx.instances.fetch_add(1, Ordering::Relaxed);
            self.evaluate_scope_rules(ctx, handle.scope, handle.location, &mut set, &mut matches);
        }

        InstanceOutcome { promoted: set, matches }
    }

    /// Run every rule declared at `scope` against one instance's visible
    /// feature set, in dependency-topological order.
    fn evaluate_scope_rules(
        &self,
        ctx: &EvalContext<'_>,
        scope: Scope,
        location: Location,
        set: &mut FeatureSet,
        matches: &mut Vec<MatchResult>,
    ) {
        for &rule_id in self.rules.rules_for_scope(scope) {
            if ctx.expired() {
                return;
            }
            // One evaluation per (rule, instance) pair: a referenced rule's
            // verdict must not depend on who asks.
            if ctx.memo.contains_key(&(rule_id, location)) {
                continue;
            }
            let rule = self.rules.rule(rule_id);
            let node = evaluate_node(ctx, &rule.logic, set, location);
            let satisfied = node.satisfied;
            ctx.memo.insert((rule_id, location), ());

            if satisfied {
                inject_match(self.rules, set, &rule.name, location);
                matches.push(MatchResult {
                    rule: rule.name.clone(),
                    location,
                    satisfied,
                    node,
                });
            }
        }
    }
}

/// Promote a satisfied rule as a synthetic feature: its name and every
/// namespace prefix become visible to this instance (for later same-scope
/// rules) and, through feature promotion, to every ancestor instance.
fn inject_match(rules: &RuleSet, set: &mut FeatureSet, rule_name: &str, location: Location) {
    if let Some(rule) = rules.by_name(rule_name) {
        set.add(Feature::MatchedRule(rule.name.clone()), location);
        for prefix in rule.namespace_prefixes() {
            set.add(Feature::MatchedRule(prefix.to_string()), location);
        }
    }
}

/// Recursive AST evaluation against one instance's visible feature set.
///
/// No short-circuiting: every child's verdict and witness locations are
/// retained for the result tree even once the node's own value is decided.
fn evaluate_node(
    ctx: &EvalContext<'_>,
    node: &Node,
    set: &FeatureSet,
    instance: Location,
) -> NodeResult {
    let patterns = ctx.rules.patterns();
    match node {
        Node::Feature(feature) => {
            let locations = set.witnesses(feature, patterns);
            NodeResult {
                label: node.label(),
                satisfied: !locations.is_empty(),
                locations,
                children: Vec::new(),
            }
        }
        Node::Match(reference) => {
            let locations = set.witnesses(&Feature::MatchedRule(reference.clone()), patterns);
            NodeResult {
                label: node.label(),
                satisfied: !locations.is_empty(),
                locations,
                children: Vec::new(),
            }
        }
        Node::Count { feature, min, max } => {
            let locations = set.witnesses(feature, patterns);
            let n = locations.len();
            let satisfied = n >= *min && max.map_or(true, |max| n <= max);
            NodeResult {
                label: node.label(),
                satisfied,
                locations: if satisfied { locations } else { BTreeSet::new() },
                children: Vec::new(),
            }
        }
        Node::Not(child) => {
            let child = evaluate_node(ctx, child, set, instance);
            let satisfied = !child.satisfied;
            NodeResult {
                label: node.label(),
                satisfied,
                // Absence is scope-wide, so the witness is the instance
                // itself rather than any single feature location.
                locations: if satisfied { BTreeSet::from([instance]) } else { BTreeSet::new() },
                children: vec![child],
            }
        }
        Node::Optional(child) => {
            let child = evaluate_node(ctx, child, set, instance);
            NodeResult {
                label: node.label(),
                // Never fails the parent; the child's real verdict stays
                // visible in the result tree.
                satisfied: true,
                locations: child.locations.clone(),
                children: vec![child],
            }
        }
        Node::And(children) | Node::Or(children) | Node::Some { children, .. } => {
            let results: Vec<NodeResult> = children
                .iter()
                .map(|child| evaluate_node(ctx, child, set, instance))
                .collect();
            let satisfied_count = results.iter().filter(|r| r.satisfied).count();
            let satisfied = match node {
                Node::And(_) => satisfied_count == results.len(),
                Node::Or(_) => satisfied_count >= 1,
                Node::Some { count, .. } => satisfied_count >= *count,
                _ => unreachable!(),
            };
            let locations = results
                .iter()
                .filter(|r| r.satisfied)
                .flat_map(|r| r.locations.iter().copied())
                .collect();
            NodeResult { label: node.label(), satisfied, locations, children: results }
        }
    }
}
