//! Error types for action handlers.

use thiserror::Error;

/// Errors returned by `Action::validate` and `Action::apply`.
#[derive(Debug, Error)]
pub enum ActionError {
    /// Missing or malformed arguments. Never retried.
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    /// The handler ran and reported failure.
    #[error("{reason}")]
    Failed {
        reason: String,
        /// Outcome message reported alongside the failure.
        outcome: Option<String>,
    },

    /// Supervisor call failed.
    #[error("supervisor: {0}")]
    Supervisor(String),

    /// The handler observed cancellation.
    #[error("cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ActionError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidArgs(reason.into())
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
            outcome: None,
        }
    }

    /// Attach an outcome message to a `Failed` error; other variants are unchanged.
    pub fn with_outcome(self, message: impl Into<String>) -> Self {
        match self {
            Self::Failed { reason, .. } => Self::Failed {
                reason,
                outcome: Some(message.into()),
            },
            other => other,
        }
    }

    pub fn outcome(&self) -> Option<&str> {
        match self {
            Self::Failed { outcome, .. } => outcome.as_deref(),
            _ => None,
        }
    }
}
