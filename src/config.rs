use std::time::Duration;

use crate::error::{DiscernError, Result};

/// Performance limits for rule loading and evaluation
pub const MAX_RULE_FILE_SIZE: u64 = 1024 * 1024; // 1MB
pub const MAX_REGEX_SIZE: usize = 1 << 20;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Per-run evaluation limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvaluationLimits {
    /// Wall-clock budget for one sample; past it the sweep stops and the
    /// partial result document is returned marked incomplete.
    pub timeout: Option<Duration>,
    /// Evaluate independent scope instances on the rayon pool.
    pub parallel: bool,
}

impl Default for EvaluationLimits {
    fn default() -> Self {
        Self { timeout: Some(DEFAULT_TIMEOUT), parallel: true }
    }
}

impl EvaluationLimits {
    pub fn new(timeout: Option<Duration>, parallel: bool) -> Result<Self> {
        if let Some(timeout) = timeout {
            if timeout.is_zero() {
                return Err(DiscernError::configuration("timeout must be greater than zero"));
            }
        }
        Ok(Self { timeout, parallel })
    }

    /// No deadline, serial evaluation. Used by determinism-sensitive callers.
    pub fn unbounded_serial() -> Self {
        Self { timeout: None, parallel: false }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_timeout_rejected() {
        assert!(EvaluationLimits::new(Some(Duration::ZERO), true).is_err());
        assert!(EvaluationLimits::new(None, true).is_ok());
    }
}
