//! Crate-level error type.
//!
//! Recoverable "no decision yet" outcomes are never errors; they surface as
//! `None` or as explicit outcome enums in the component that produced them.
//! [`OptimizerError`] is the fatal channel: it aborts the current unit of work
//! and, when raised inside a scheduled job, marks that run failed.

use crate::store::StoreError;

/// Errors that abort the current unit of work.
#[derive(Debug, thiserror::Error)]
pub enum OptimizerError {
    /// Persistence layer failed; the enclosing transaction was rolled back.
    #[error("persistence failure: {0}")]
    Store(#[from] StoreError),

    /// The concurrent experiment cap is reached. No test was created.
    #[error("experiment capacity exceeded: {active} active (max {max})")]
    CapacityExceeded { active: usize, max: usize },

    /// Variant definitions for a new test are unusable.
    #[error("invalid variants: {0}")]
    InvalidVariants(String),

    /// A referenced entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// `run_now` was asked for a job id that is unknown or not registered.
    #[error("unknown job: {0}")]
    UnknownJob(String),

    /// Settings failed validation or could not be read.
    #[error("config error: {0}")]
    Config(String),

    /// A collaborator stage reported failure.
    #[error("stage '{stage}' failed: {detail}")]
    Stage { stage: String, detail: String },
}

impl OptimizerError {
    /// Convenience constructor for collaborator stage failures.
    pub fn stage(stage: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Stage { stage: stage.into(), detail: detail.into() }
    }
}

/// Result alias used throughout the crate.
pub type OptimizerResult<T> = Result<T, OptimizerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_exceeded_display() {
        let e = OptimizerError::CapacityExceeded { active: 5, max: 5 };
        assert_eq!(e.to_string(), "experiment capacity exceeded: 5 active (max 5)");
    }

    #[test]
    fn test_store_error_converts() {
        let e: OptimizerError = StoreError::NotFound("test abc".into()).into();
        assert!(matches!(e, OptimizerError::Store(_)));
        assert!(e.to_string().contains("test abc"));
    }

    #[test]
    fn test_stage_constructor() {
        let e = OptimizerError::stage("market_scan", "feed offline");
        assert_eq!(e.to_string(), "stage 'market_scan' failed: feed offline");
    }

    #[test]
    fn test_is_std_error() {
        fn assert_error<E: std::error::Error>(_: &E) {}
        assert_error(&OptimizerError::UnknownJob("nope".into()));
    }
}
