//! The action SPI.
//!
//! Steps, pre/post conditions and success probes all resolve to an `Action`.
//! A condition passes iff `validate` and `apply` both return `Ok`; there is no
//! separate check-only handler type.

use async_trait::async_trait;
use keel_core::Args;
use tokio_util::sync::CancellationToken;

use crate::error::ActionError;

/// Execution context handed to `Action::apply`.
#[derive(Debug, Clone)]
pub struct ActionContext {
    pub node_id: String,
    pub plan_id: String,
    /// Step (or condition owner) being executed; empty for plan-level probes.
    pub step_id: String,
    /// Cancelled when the plan is aborted or the step times out.
    pub cancellation_token: CancellationToken,
}

impl ActionContext {
    pub fn new(
        node_id: impl Into<String>,
        plan_id: impl Into<String>,
        step_id: impl Into<String>,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            plan_id: plan_id.into(),
            step_id: step_id.into(),
            cancellation_token,
        }
    }

    /// Context for ad-hoc calls outside a plan (CLI validation, tests).
    pub fn detached() -> Self {
        Self::new("", "", "", CancellationToken::new())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    /// Resolves when cancellation is requested.
    pub async fn cancelled(&self) {
        self.cancellation_token.cancelled().await
    }
}

/// A pluggable handler keyed by `name()` in the `ActionRegistry`.
#[async_trait]
pub trait Action: Send + Sync {
    /// Registry key.
    fn name(&self) -> &str;

    /// Pure argument check. Must reject missing or malformed required fields.
    fn validate(&self, args: &Args) -> Result<(), ActionError>;

    /// Perform the effect and return a short human-readable outcome.
    async fn apply(&self, ctx: &ActionContext, args: &Args) -> Result<String, ActionError>;
}

/// Required non-blank string argument.
pub fn required_str<'a>(args: &'a Args, key: &str) -> Result<&'a str, ActionError> {
    match args.get(key).and_then(|v| v.as_str()).map(str::trim) {
        Some(s) if !s.is_empty() => Ok(s),
        _ => Err(ActionError::invalid(format!("{key} is required"))),
    }
}

/// Optional string argument; blank strings read as absent.
pub fn optional_str<'a>(args: &'a Args, key: &str) -> Option<&'a str> {
    args.get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Optional unsigned integer argument. Accepts numbers and numeric strings.
pub fn optional_u64(args: &Args, key: &str) -> Result<Option<u64>, ActionError> {
    match args.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::Number(n)) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| ActionError::invalid(format!("{key} must be a non-negative integer"))),
        Some(serde_json::Value::String(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ActionError::invalid(format!("{key} must be a non-negative integer"))),
        Some(_) => Err(ActionError::invalid(format!(
            "{key} must be a non-negative integer"
        ))),
    }
}
