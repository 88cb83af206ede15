//! Error types for plan execution.

use keel_actions::ActionError;
use keel_core::PlanState;
use thiserror::Error;

/// A condition or probe did not pass.
#[derive(Debug, Error)]
pub enum ConditionError {
    #[error("condition handler {kind:?} not registered")]
    NotRegistered { kind: String },

    #[error("{kind}: {source}")]
    Invalid {
        kind: String,
        #[source]
        source: ActionError,
    },

    #[error("{kind}: {source}")]
    Failed {
        kind: String,
        #[source]
        source: ActionError,
    },

    #[error("{kind}: cancelled")]
    Cancelled { kind: String },
}

/// Why the desired state does not hold. Reported for the first failing check.
#[derive(Debug, Error)]
pub enum InvariantError {
    #[error("success probe {kind} failed: {source}")]
    Probe {
        kind: String,
        #[source]
        source: ConditionError,
    },

    #[error("desired service {name:?} missing unit")]
    MissingUnit { name: String },

    #[error("check service {unit}: {source}")]
    ServiceCheck {
        unit: String,
        #[source]
        source: ActionError,
    },

    #[error("service {unit} not active")]
    ServiceInactive { unit: String },

    #[error("service {service} version check: {source}")]
    VersionRead {
        service: String,
        #[source]
        source: std::io::Error,
    },

    #[error("service {service} version marker missing")]
    VersionMissing { service: String },

    #[error("service {service} version mismatch: have {have} want {want}")]
    VersionMismatch {
        service: String,
        have: String,
        want: String,
    },

    #[error("desired file path missing")]
    MissingPath,

    #[error("file {path} check: {source}")]
    FileMissing {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("file {path} mode {mode:?} is not octal")]
    InvalidMode { path: String, mode: String },

    #[error("file {path} mode mismatch: have {have:04o} want {want:04o}")]
    ModeMismatch { path: String, have: u32, want: u32 },
}

/// A single step attempt failed.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("action {action:?} not registered")]
    NotRegistered { action: String },

    #[error("{0}")]
    Invalid(#[source] ActionError),

    #[error("pre condition {kind} failed: {source}")]
    PreCondition {
        kind: String,
        #[source]
        source: ConditionError,
    },

    #[error("{0}")]
    Apply(#[source] ActionError),

    #[error("timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("post condition {kind} failed: {source}")]
    PostCondition {
        kind: String,
        #[source]
        source: ConditionError,
        /// Outcome of the apply that preceded the failed check.
        outcome: String,
    },

    #[error("cancelled")]
    Cancelled,
}

impl StepError {
    /// Malformed plans and cancellation end the step at once.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::NotRegistered { .. } | Self::Invalid(_) | Self::Cancelled
        )
    }

    /// Handler outcome message carried by the failure, if any.
    pub fn outcome(&self) -> Option<&str> {
        match self {
            Self::Apply(e) => e.outcome(),
            Self::PostCondition { outcome, .. } if !outcome.is_empty() => Some(outcome),
            _ => None,
        }
    }
}

/// Terminal outcome of a reconciliation that did not succeed.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("step {step_id} failed: {source}")]
    StepFailed {
        step_id: String,
        #[source]
        source: StepError,
    },

    /// Rollback completed; `source` is the failure that triggered it.
    #[error("rolled back after step {step_id} failed: {source}")]
    RolledBack {
        step_id: String,
        #[source]
        source: StepError,
    },

    #[error("rollback {rollback_step_id} failed: {source}; original failure: {original}")]
    RollbackFailed {
        rollback_step_id: String,
        #[source]
        source: StepError,
        original: String,
    },

    #[error("invariants not satisfied after retries")]
    InvariantsNotSatisfied,

    #[error("reconciliation cancelled")]
    Cancelled,

    /// A terminal status for this generation was replayed unchanged.
    #[error("plan already {state}")]
    Terminal { state: PlanState },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(!StepError::NotRegistered { action: "x".into() }.is_retryable());
        assert!(!StepError::Invalid(ActionError::invalid("path is required")).is_retryable());
        assert!(!StepError::Cancelled.is_retryable());
        assert!(StepError::Apply(ActionError::failed("boom")).is_retryable());
        assert!(StepError::Timeout { timeout_ms: 10 }.is_retryable());
        assert!(
            StepError::PreCondition {
                kind: "file.exists".into(),
                source: ConditionError::NotRegistered {
                    kind: "file.exists".into()
                },
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_outcome() {
        let err = StepError::Apply(ActionError::failed("mismatch").with_outcome("at 1.0"));
        assert_eq!(err.outcome(), Some("at 1.0"));
        assert_eq!(StepError::Timeout { timeout_ms: 1 }.outcome(), None);
    }
}
