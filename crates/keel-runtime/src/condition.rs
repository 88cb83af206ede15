use keel_actions::{ActionContext, ActionRegistry};
use keel_core::Condition;

use crate::error::ConditionError;

/// Resolve `cond.kind` in the registry, then validate and apply it.
///
/// The outcome message is returned on success; any error is a failed check.
/// Cancelling `ctx` abandons the check even if the handler ignores it.
pub async fn evaluate_condition(
    registry: &ActionRegistry,
    ctx: &ActionContext,
    cond: &Condition,
) -> Result<String, ConditionError> {
    let handler = registry
        .get(&cond.kind)
        .ok_or_else(|| ConditionError::NotRegistered {
            kind: cond.kind.clone(),
        })?;
    handler
        .validate(&cond.args)
        .map_err(|source| ConditionError::Invalid {
            kind: cond.kind.clone(),
            source,
        })?;
    let applied = tokio::select! {
        _ = ctx.cancelled() => {
            return Err(ConditionError::Cancelled {
                kind: cond.kind.clone(),
            });
        }
        res = handler.apply(ctx, &cond.args) => res,
    };
    applied.map_err(|source| ConditionError::Failed {
        kind: cond.kind.clone(),
        source,
    })
}
