use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("controller endpoint is not configured")]
    NoEndpoint,

    #[error("connect {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },

    /// The controller (or the leader it redirected to) rejected the call.
    #[error("controller rpc failed: {0}")]
    Rpc(#[from] tonic::Status),
}
