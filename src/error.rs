//! Error types for the snapshot migrator
//!
//! Provides structured error types for the waiter, retry policy, migration
//! stages, orchestrator, and run-state persistence.

use crate::domain::ports::RemoteError;
use crate::migration::state::PipelineRunState;
use crate::waiter::rules::TerminationRule;
use std::time::Duration;
use thiserror::Error;

/// Unified error type for the migrator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Remote Control-Plane Errors
    // =========================================================================
    #[error("Remote control plane error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Response did not contain {path} for {context}")]
    MissingOutput { context: String, path: String },

    // =========================================================================
    // Waiter Errors
    // =========================================================================
    #[error("Waiter {waiter} timed out after {attempts} attempts")]
    WaiterTimeout { waiter: String, attempts: u32 },

    #[error("Waiter {waiter} reached failure state on attempt {attempt}: {rule}")]
    WaiterRuleFailure {
        waiter: String,
        attempt: u32,
        rule: Box<TerminationRule>,
    },

    #[error("Invalid extract path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    // =========================================================================
    // Stage / Pipeline Errors
    // =========================================================================
    #[error("Stage {stage} failed: {cause}")]
    Stage {
        stage: String,
        #[source]
        cause: Box<Error>,
    },

    #[error("Stage {stage} requires input '{input}' which no earlier stage produces")]
    MissingInput { stage: String, input: String },

    #[error("Pipeline not found: {0}")]
    PipelineNotFound(String),

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Run already active: {0}")]
    RunActive(String),

    #[error("Run {run_id} aborted at stage {stage}: {cause}")]
    RunAborted {
        run_id: String,
        stage: String,
        #[source]
        cause: Box<Error>,
        state: Box<PipelineRunState>,
    },

    // =========================================================================
    // Cancellation / Deadline
    // =========================================================================
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Run exceeded wall-clock timeout of {0:?}")]
    RunTimeout(Duration),

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification used by retry classifiers and operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Throttling or eventual-consistency errors, safe to retry
    Transient,
    /// Resource entered a state the rule set marks as failure
    RuleFailure,
    /// Waiter or run deadline exhausted
    Timeout,
    /// Permission, validation, conflict and everything else
    NonRetryable,
    /// Cooperative abort; says nothing about resource health
    Cancelled,
}

/// Remote error codes that signal throttling or a temporarily unavailable service
pub const THROTTLING_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "RequestLimitExceeded",
    "TooManyRequestsException",
    "SlowDown",
    "ServiceUnavailable",
    "InternalFailure",
    "RequestTimeout",
];

impl Error {
    /// Classify this error
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Remote(remote) if remote.is_throttling() => ErrorClass::Transient,
            Error::WaiterRuleFailure { .. } => ErrorClass::RuleFailure,
            Error::WaiterTimeout { .. } | Error::RunTimeout(_) => ErrorClass::Timeout,
            Error::Cancelled => ErrorClass::Cancelled,
            Error::Stage { cause, .. } | Error::RunAborted { cause, .. } => cause.class(),
            _ => ErrorClass::NonRetryable,
        }
    }

    /// Check if this error is retryable under the default classification
    pub fn is_retryable(&self) -> bool {
        matches!(self.class(), ErrorClass::Transient)
    }

    /// Check if this error is a cancellation (directly or wrapped)
    pub fn is_cancelled(&self) -> bool {
        matches!(self.class(), ErrorClass::Cancelled)
    }

    /// Remote error code carried by this error, unwrapping stage context
    pub fn remote_code(&self) -> Option<&str> {
        match self {
            Error::Remote(remote) => Some(remote.code.as_str()),
            Error::Stage { cause, .. } | Error::RunAborted { cause, .. } => cause.remote_code(),
            _ => None,
        }
    }

    /// Partial run state attached to a run-level failure
    pub fn run_state(&self) -> Option<&PipelineRunState> {
        match self {
            Error::RunAborted { state, .. } => Some(state),
            _ => None,
        }
    }

    /// Wrap this error with stage identity
    pub fn in_stage(self, stage: impl Into<String>) -> Self {
        match self {
            // cancellation passes through unwrapped so callers can tell it apart
            Error::Cancelled => Error::Cancelled,
            other => Error::Stage {
                stage: stage.into(),
                cause: Box::new(other),
            },
        }
    }
}

/// Result type alias for the migrator
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::waiter::rules::{Matcher, Outcome};

    #[test]
    fn test_error_classes() {
        let throttled = Error::Remote(RemoteError::new("ThrottlingException", "slow down"));
        assert_eq!(throttled.class(), ErrorClass::Transient);
        assert!(throttled.is_retryable());

        let denied = Error::Remote(RemoteError::new("AccessDenied", "nope"));
        assert_eq!(denied.class(), ErrorClass::NonRetryable);
        assert!(!denied.is_retryable());

        let timeout = Error::WaiterTimeout {
            waiter: "db_cluster_available".into(),
            attempts: 60,
        };
        assert_eq!(timeout.class(), ErrorClass::Timeout);

        let rule = TerminationRule::new(Matcher::exact("Status", "failed"), Outcome::Failure);
        let failed = Error::WaiterRuleFailure {
            waiter: "x".into(),
            attempt: 2,
            rule: Box::new(rule),
        };
        assert_eq!(failed.class(), ErrorClass::RuleFailure);
        assert!(!failed.is_retryable());
    }

    #[test]
    fn test_stage_wrapping_keeps_class() {
        let err = Error::Remote(RemoteError::new("SlowDown", "")).in_stage("copy-snapshot");
        assert_eq!(err.class(), ErrorClass::Transient);
        assert_eq!(err.remote_code(), Some("SlowDown"));
        assert!(err.to_string().contains("copy-snapshot"));

        assert!(matches!(Error::Cancelled.in_stage("share"), Error::Cancelled));
    }
}
