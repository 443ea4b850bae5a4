//! DISCERN - Capability rule matching engine for program analysis.
//!
//! This library matches a corpus of declarative rules ("can send HTTP
//! requests", "can inject into a process") against typed features extracted
//! from executable programs, statically or dynamically. Binary parsing and
//! feature extraction live behind the [`FeatureExtractor`] trait; the engine
//! only indexes and queries `(Feature, Location)` streams, so the same rule
//! set behaves identically over a disassembly backend and a replayed
//! sandbox trace.
//!
//! # Example
//!
//! ```no_run
//! use discern::{match_extractor, EvaluationLimits, RecordedExtractor, RuleSet, ScopeAxis};
//!
//! let rules = RuleSet::from_directory("rules/").unwrap();
//! let trace = RecordedExtractor::new(ScopeAxis::Dynamic);
//! let doc = match_extractor(&rules, &trace, &EvaluationLimits::default()).unwrap();
//!
//! for matched in &doc.rules {
//!     println!("{} ({}): {} matches", matched.name, matched.namespace, matched.matches.len());
//! }
//! ```

pub mod config;
pub mod error;
pub mod eval;
pub mod extractor;
pub mod features;
pub mod result;
pub mod rules;
pub mod ruleset;
pub mod scopes;

// Re-export commonly used types at crate root
pub use config::EvaluationLimits;
pub use error::{DiscernError, Result};
pub use eval::{match_extractor, Evaluator};
pub use extractor::{FeatureExtractor, InstanceHandle, RecordedExtractor};
pub use features::{Feature, FeatureKind, FeatureSet, Location};
pub use result::{MatchResult, NodeResult, ResultDocument, RuleMatches};
pub use rules::{parse_rule, Node, Rule, RuleMeta};
pub use ruleset::{RuleId, RuleSet};
pub use scopes::{Scope, ScopeAxis};
