use std::path::PathBuf;
use thiserror::Error;

use crate::features::Location;

/// Discern's custom error types for rule loading and evaluation.
#[derive(Debug, Error)]
pub enum DiscernError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("rule syntax error in {source_name}: {message}")]
    RuleSyntax { source_name: String, message: String },

    #[error("rule '{rule}' uses {feature} at incompatible scope '{scope}'")]
    ScopeMismatch {
        rule: String,
        feature: String,
        scope: String,
    },

    #[error("duplicate rule name '{name}' (first seen in {first_seen})")]
    DuplicateRule { name: String, first_seen: String },

    #[error("rule '{rule}' references unknown rule or namespace '{reference}'")]
    UnresolvedReference { rule: String, reference: String },

    #[error("cyclic rule dependency: {}", cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("feature extraction failed at {location}: {message}")]
    Extraction { location: Location, message: String },

    #[error("configuration error: {message}")]
    Configuration { message: String },

    #[error("rule directory does not exist: {path}")]
    RuleDirectoryNotFound { path: PathBuf },
}

pub type Result<T> = std::result::Result<T, DiscernError>;

impl DiscernError {
    pub fn rule_syntax<S1: Into<String>, S2: Into<String>>(source_name: S1, message: S2) -> Self {
        Self::RuleSyntax { source_name: source_name.into(), message: message.into() }
    }

    pub fn scope_mismatch<S1: Into<String>, S2: Into<String>, S3: Into<String>>(
        rule: S1,
        feature: S2,
        scope: S3,
    ) -> Self {
        Self::ScopeMismatch { rule: rule.into(), feature: feature.into(), scope: scope.into() }
    }

    pub fn duplicate_rule<S1: Into<String>, S2: Into<String>>(name: S1, first_seen: S2) -> Self {
        Self::DuplicateRule { name: name.into(), first_seen: first_seen.into() }
    }

    pub fn unresolved_reference<S1: Into<String>, S2: Into<String>>(rule: S1, reference: S2) -> Self {
        Self::UnresolvedReference { rule: rule.into(), reference: reference.into() }
    }

    pub fn cyclic_dependency(cycle: Vec<String>) -> Self {
        Self::CyclicDependency { cycle }
    }

    pub fn extraction<S: Into<String>>(location: Location, message: S) -> Self {
        Self::Extraction { location, message: message.into() }
    }

    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Returns true if the error invalidates the whole rule-set load.
    ///
    /// A single malformed rule file is not fatal (the rest of the corpus still
    /// loads); an unresolvable or cyclic dependency graph is, because no
    /// evaluation order exists.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::DuplicateRule { .. }
                | Self::UnresolvedReference { .. }
                | Self::CyclicDependency { .. }
                | Self::Configuration { .. }
                | Self::RuleDirectoryNotFound { .. }
        )
    }

    /// Returns true if evaluation can continue past this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Extraction { .. } | Self::RuleSyntax { .. })
    }
}
