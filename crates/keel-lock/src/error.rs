//! Error types for the lock and bundle stores.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    /// The lock backend could not be reached or refused the request.
    #[error("lock backend unavailable: {0}")]
    Unavailable(String),

    #[error("lease ttl must be positive")]
    InvalidTtl,

    #[error("{key} not found")]
    NotFound { key: String },

    #[error("timed out waiting for {key}")]
    Timeout { key: String },

    #[error("cancelled")]
    Cancelled,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("decode error: {0}")]
    Decode(#[from] base64::DecodeError),
}
