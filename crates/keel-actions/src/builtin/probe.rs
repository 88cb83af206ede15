use async_trait::async_trait;
use keel_core::Args;

use crate::action::{Action, ActionContext, optional_str};
use crate::error::ActionError;

/// Always succeeds.
pub struct ProbeSuccess;

#[async_trait]
impl Action for ProbeSuccess {
    fn name(&self) -> &str {
        "probe.success"
    }

    fn validate(&self, _args: &Args) -> Result<(), ActionError> {
        Ok(())
    }

    async fn apply(&self, _ctx: &ActionContext, _args: &Args) -> Result<String, ActionError> {
        Ok("ok".to_string())
    }
}

/// Always fails, with an optional `reason`.
pub struct ProbeFail;

#[async_trait]
impl Action for ProbeFail {
    fn name(&self) -> &str {
        "probe.fail"
    }

    fn validate(&self, _args: &Args) -> Result<(), ActionError> {
        Ok(())
    }

    async fn apply(&self, _ctx: &ActionContext, args: &Args) -> Result<String, ActionError> {
        let reason = optional_str(args, "reason").unwrap_or("probe failed");
        Err(ActionError::failed(reason))
    }
}
