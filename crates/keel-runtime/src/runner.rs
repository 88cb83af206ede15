//! Plan state machine.
//!
//! `PENDING -> RUNNING -> SUCCEEDED | FAILED | ROLLING_BACK -> ROLLED_BACK | FAILED`
//!
//! A plan attempt runs every step once, in order. After each step that
//! completes, the invariants are re-checked and the plan ends early once they
//! hold. A step that exhausts its own retries ends the plan, through rollback
//! when the policy asks for it. If a full pass leaves the invariants failing,
//! the whole plan is retried after a linear backoff.

use keel_actions::{Action, ActionContext, ActionError, ActionRegistry, Supervisor, VersionMarkers};
use keel_core::{
    Clock, EventLevel, FailureMode, NodePlan, NodePlanStatus, PlanState, PlanStep, StepState,
    system_clock,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::condition::evaluate_condition;
use crate::error::{ConditionError, RunnerError, StepError};
use crate::invariants::InvariantChecker;
use crate::publisher::{NoopPublisher, StatusPublisher};

/// Error message recorded when the retry budget runs out with invariants failing.
pub const INVARIANTS_FAILED: &str = "invariants not satisfied after retries";

const CANCELLED: &str = "reconciliation cancelled";

/// Event wording for the main step list or the rollback list.
#[derive(Debug, Clone, Copy)]
enum Phase {
    Step,
    Rollback,
}

impl Phase {
    fn label(self) -> &'static str {
        match self {
            Self::Step => "step",
            Self::Rollback => "rollback",
        }
    }

    fn running_level(self) -> EventLevel {
        match self {
            Self::Step => EventLevel::Info,
            Self::Rollback => EventLevel::Warn,
        }
    }
}

pub struct Runner {
    node_id: String,
    registry: Arc<ActionRegistry>,
    invariants: InvariantChecker,
    publisher: Arc<dyn StatusPublisher>,
    clock: Clock,
    default_backoff: Duration,
}

impl Runner {
    pub fn new(
        node_id: impl Into<String>,
        registry: Arc<ActionRegistry>,
        supervisor: Arc<dyn Supervisor>,
        markers: VersionMarkers,
    ) -> Self {
        let invariants = InvariantChecker::new(registry.clone(), supervisor, markers);
        Self {
            node_id: node_id.into(),
            registry,
            invariants,
            publisher: Arc::new(NoopPublisher),
            clock: system_clock(),
            default_backoff: Duration::from_secs(2),
        }
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn StatusPublisher>) -> Self {
        self.publisher = publisher;
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Backoff used when a plan leaves `retry_backoff_ms` at zero.
    pub fn with_default_backoff(mut self, backoff: Duration) -> Self {
        self.default_backoff = backoff;
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Converge `plan`, starting from the last recorded status for the node.
    ///
    /// A status for a different `(plan_id, generation)` is discarded. A
    /// terminal status for the same generation is returned unchanged without
    /// running anything. The returned status is always the final snapshot;
    /// the result says whether the plan succeeded.
    pub async fn reconcile_plan(
        &self,
        cancel: &CancellationToken,
        plan: &NodePlan,
        current: Option<NodePlanStatus>,
    ) -> (NodePlanStatus, Result<(), RunnerError>) {
        let mut status = match current {
            Some(status) if status.tracks(plan) => status,
            Some(stale) => {
                tracing::debug!(
                    plan_id = %plan.plan_id,
                    generation = plan.generation,
                    stale_generation = stale.generation,
                    "discarding status of previous plan"
                );
                NodePlanStatus::for_plan(plan, &self.node_id, self.now())
            }
            None => NodePlanStatus::for_plan(plan, &self.node_id, self.now()),
        };

        if status.is_terminal() {
            let result = match status.state {
                PlanState::Succeeded => Ok(()),
                state => Err(RunnerError::Terminal { state }),
            };
            return (status, result);
        }
        if status.started_ms == 0 {
            status.started_ms = self.now();
        }

        let result = self.drive(cancel, plan, &mut status).await;
        match &result {
            Ok(()) => tracing::info!(
                plan_id = %plan.plan_id,
                generation = plan.generation,
                "plan succeeded"
            ),
            Err(e) => tracing::warn!(
                plan_id = %plan.plan_id,
                generation = plan.generation,
                state = %status.state,
                error = %e,
                "plan did not succeed"
            ),
        }
        (status, result)
    }

    async fn drive(
        &self,
        cancel: &CancellationToken,
        plan: &NodePlan,
        status: &mut NodePlanStatus,
    ) -> Result<(), RunnerError> {
        if plan.spec.has_invariants() && self.invariants_hold(cancel, plan).await {
            self.succeed(status).await;
            return Ok(());
        }

        status.state = PlanState::Running;
        let now = self.now();
        status.push_event(now, EventLevel::Info, "plan running", "");
        self.publish(status).await;

        let attempts = plan.policy.max_retries.saturating_add(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Err(self.cancelled(status).await);
            }
            self.run_steps_once(cancel, plan, status).await?;

            if self.invariants_hold(cancel, plan).await {
                self.succeed(status).await;
                return Ok(());
            }
            if cancel.is_cancelled() {
                return Err(self.cancelled(status).await);
            }
            if attempt >= attempts {
                break;
            }

            let now = self.now();
            status.push_event(now, EventLevel::Warn, "invariants still failing; retrying plan", "");
            self.publish(status).await;
            if !self.sleep_backoff(cancel, plan, attempt).await {
                return Err(self.cancelled(status).await);
            }
        }

        let now = self.now();
        status.state = PlanState::Failed;
        status.error_message = INVARIANTS_FAILED.to_string();
        status.finished_ms = now;
        status.push_event(now, EventLevel::Error, INVARIANTS_FAILED, "");
        self.publish(status).await;
        Err(RunnerError::InvariantsNotSatisfied)
    }

    /// One pass over `spec.steps`. `Ok` when the pass finished or the
    /// invariants came to hold part way; `Err` once the plan is terminal.
    async fn run_steps_once(
        &self,
        cancel: &CancellationToken,
        plan: &NodePlan,
        status: &mut NodePlanStatus,
    ) -> Result<(), RunnerError> {
        for step in &plan.spec.steps {
            if cancel.is_cancelled() {
                return Err(self.cancelled(status).await);
            }
            self.mark_step_running(status, step, Phase::Step).await;

            match self
                .run_step_with_retry(cancel, plan, step, status, Phase::Step)
                .await
            {
                Ok(()) => {}
                Err(StepError::Cancelled) => return Err(self.cancelled(status).await),
                Err(err) => return Err(self.escalate(cancel, plan, step, err, status).await),
            }

            self.mark_step_ok(status, step, Phase::Step).await;
            status.current_step_id.clear();

            if plan.spec.has_invariants() && self.invariants_hold(cancel, plan).await {
                return Ok(());
            }
        }
        Ok(())
    }

    /// Attempt `step` up to `max_retries + 1` times.
    async fn run_step_with_retry(
        &self,
        cancel: &CancellationToken,
        plan: &NodePlan,
        step: &PlanStep,
        status: &mut NodePlanStatus,
        phase: Phase,
    ) -> Result<(), StepError> {
        let attempts = step.policy.max_retries.saturating_add(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            status.step_mut(&step.id).attempt = attempt;

            let err = match self.run_step(cancel, plan, step).await {
                Ok(message) => {
                    if !message.is_empty() {
                        status.step_mut(&step.id).message = message;
                    }
                    return Ok(());
                }
                Err(err) => err,
            };
            if matches!(err, StepError::Cancelled) {
                return Err(err);
            }

            let now = self.now();
            let entry = status.step_mut(&step.id);
            if let Some(outcome) = err.outcome() {
                entry.message = outcome.to_string();
            }
            entry.state = StepState::Failed;
            entry.finished_ms = now;
            status.push_event(
                now,
                EventLevel::Error,
                format!("{} {} failed: {err}", phase.label(), step.id),
                step.id.as_str(),
            );
            self.publish(status).await;
            tracing::warn!(
                step_id = %step.id,
                attempt,
                attempts,
                error = %err,
                "{} attempt failed",
                phase.label()
            );

            if !err.is_retryable() || attempt >= attempts {
                return Err(err);
            }
            if !self.sleep_backoff(cancel, plan, attempt).await {
                return Err(StepError::Cancelled);
            }
            let entry = status.step_mut(&step.id);
            entry.state = StepState::Running;
            entry.finished_ms = 0;
        }
    }

    /// Resolve, validate, check `pre`, apply, check `post`.
    async fn run_step(
        &self,
        cancel: &CancellationToken,
        plan: &NodePlan,
        step: &PlanStep,
    ) -> Result<String, StepError> {
        let handler = self
            .registry
            .get(&step.action)
            .ok_or_else(|| StepError::NotRegistered {
                action: step.action.clone(),
            })?;
        handler.validate(&step.args).map_err(StepError::Invalid)?;

        let ctx = ActionContext::new(
            self.node_id.as_str(),
            plan.plan_id.as_str(),
            step.id.as_str(),
            cancel.child_token(),
        );
        for cond in &step.pre {
            evaluate_condition(&self.registry, &ctx, cond)
                .await
                .map_err(|source| match source {
                    ConditionError::Cancelled { .. } => StepError::Cancelled,
                    source => StepError::PreCondition {
                        kind: cond.kind.clone(),
                        source,
                    },
                })?;
        }

        let outcome = self.apply(cancel, handler.as_ref(), &ctx, step).await?;

        for cond in &step.post {
            if let Err(source) = evaluate_condition(&self.registry, &ctx, cond).await {
                if matches!(source, ConditionError::Cancelled { .. }) {
                    return Err(StepError::Cancelled);
                }
                return Err(StepError::PostCondition {
                    kind: cond.kind.clone(),
                    source,
                    outcome,
                });
            }
        }
        Ok(outcome)
    }

    async fn apply(
        &self,
        cancel: &CancellationToken,
        handler: &dyn Action,
        ctx: &ActionContext,
        step: &PlanStep,
    ) -> Result<String, StepError> {
        let timeout_ms = step.policy.timeout_ms;
        let applied = if timeout_ms > 0 {
            let limit = Duration::from_millis(timeout_ms);
            tokio::select! {
                _ = cancel.cancelled() => return Err(StepError::Cancelled),
                res = tokio::time::timeout(limit, handler.apply(ctx, &step.args)) => match res {
                    Ok(res) => res,
                    Err(_) => {
                        ctx.cancellation_token.cancel();
                        return Err(StepError::Timeout { timeout_ms });
                    }
                },
            }
        } else {
            tokio::select! {
                _ = cancel.cancelled() => return Err(StepError::Cancelled),
                res = handler.apply(ctx, &step.args) => res,
            }
        };
        match applied {
            Ok(outcome) => Ok(outcome),
            Err(ActionError::Cancelled) if cancel.is_cancelled() => Err(StepError::Cancelled),
            Err(e) => Err(StepError::Apply(e)),
        }
    }

    /// Record the step failure and finish the plan as FAILED, or roll back.
    async fn escalate(
        &self,
        cancel: &CancellationToken,
        plan: &NodePlan,
        step: &PlanStep,
        err: StepError,
        status: &mut NodePlanStatus,
    ) -> RunnerError {
        status.error_message = err.to_string();
        status.error_step_id = step.id.clone();

        let rollback = step.policy.on_fail == FailureMode::Rollback
            || plan.policy.failure_mode == FailureMode::Rollback;
        if !rollback {
            let now = self.now();
            status.state = PlanState::Failed;
            status.finished_ms = now;
            status.push_event(
                now,
                EventLevel::Error,
                format!("plan failed at step {}", step.id),
                step.id.as_str(),
            );
            self.publish(status).await;
            return RunnerError::StepFailed {
                step_id: step.id.clone(),
                source: err,
            };
        }

        status.state = PlanState::RollingBack;
        let now = self.now();
        status.push_event(
            now,
            EventLevel::Warn,
            format!("rolling back after step {} failed", step.id),
            step.id.as_str(),
        );
        self.publish(status).await;

        match self.run_rollback(cancel, plan, status).await {
            Ok(()) => {
                let now = self.now();
                status.state = PlanState::RolledBack;
                status.current_step_id.clear();
                status.finished_ms = now;
                status.push_event(now, EventLevel::Warn, "plan rolled back", step.id.as_str());
                self.publish(status).await;
                RunnerError::RolledBack {
                    step_id: step.id.clone(),
                    source: err,
                }
            }
            Err((_, StepError::Cancelled)) => {
                let message = format!("{err}; cancelled during rollback");
                self.cancelled_with(status, message).await
            }
            Err((rollback_step_id, source)) => {
                let now = self.now();
                let original = err.to_string();
                status.state = PlanState::Failed;
                status.finished_ms = now;
                status.error_message = format!("rollback failed: {source}; original failure: {original}");
                status.push_event(
                    now,
                    EventLevel::Error,
                    status.error_message.clone(),
                    rollback_step_id.as_str(),
                );
                self.publish(status).await;
                RunnerError::RollbackFailed {
                    rollback_step_id,
                    source,
                    original,
                }
            }
        }
    }

    /// Run `spec.rollback` in order. The first failing rollback step ends it.
    async fn run_rollback(
        &self,
        cancel: &CancellationToken,
        plan: &NodePlan,
        status: &mut NodePlanStatus,
    ) -> Result<(), (String, StepError)> {
        for step in &plan.spec.rollback {
            if cancel.is_cancelled() {
                return Err((step.id.clone(), StepError::Cancelled));
            }
            self.mark_step_running(status, step, Phase::Rollback).await;
            self.run_step_with_retry(cancel, plan, step, status, Phase::Rollback)
                .await
                .map_err(|e| (step.id.clone(), e))?;
            self.mark_step_ok(status, step, Phase::Rollback).await;
        }
        Ok(())
    }

    async fn mark_step_running(&self, status: &mut NodePlanStatus, step: &PlanStep, phase: Phase) {
        let now = self.now();
        let entry = status.step_mut(&step.id);
        entry.state = StepState::Running;
        entry.started_ms = now;
        entry.finished_ms = 0;
        status.current_step_id = step.id.clone();
        status.push_event(
            now,
            phase.running_level(),
            format!("{} {} running", phase.label(), step.id),
            step.id.as_str(),
        );
        self.publish(status).await;
    }

    async fn mark_step_ok(&self, status: &mut NodePlanStatus, step: &PlanStep, phase: Phase) {
        let now = self.now();
        let entry = status.step_mut(&step.id);
        entry.state = StepState::Ok;
        entry.finished_ms = now;
        status.push_event(
            now,
            EventLevel::Info,
            format!("{} {} succeeded", phase.label(), step.id),
            step.id.as_str(),
        );
        self.publish(status).await;
    }

    async fn succeed(&self, status: &mut NodePlanStatus) {
        let now = self.now();
        status.state = PlanState::Succeeded;
        status.current_step_id.clear();
        status.finished_ms = now;
        status.push_event(now, EventLevel::Info, "invariants satisfied; plan complete", "");
        self.publish(status).await;
    }

    async fn cancelled(&self, status: &mut NodePlanStatus) -> RunnerError {
        self.cancelled_with(status, CANCELLED.to_string()).await
    }

    async fn cancelled_with(&self, status: &mut NodePlanStatus, error_message: String) -> RunnerError {
        let now = self.now();
        status.state = PlanState::Failed;
        status.error_message = error_message;
        if status.error_step_id.is_empty() {
            status.error_step_id = status.current_step_id.clone();
        }
        status.finished_ms = now;
        status.push_event(now, EventLevel::Error, CANCELLED, status.current_step_id.clone());
        self.publish(status).await;
        RunnerError::Cancelled
    }

    async fn invariants_hold(&self, cancel: &CancellationToken, plan: &NodePlan) -> bool {
        let ctx = ActionContext::new(
            self.node_id.as_str(),
            plan.plan_id.as_str(),
            "",
            cancel.child_token(),
        );
        let evaluated = tokio::select! {
            _ = cancel.cancelled() => return false,
            res = self.invariants.evaluate(&ctx, &plan.spec) => res,
        };
        match evaluated {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(plan_id = %plan.plan_id, reason = %e, "invariants not met");
                false
            }
        }
    }

    /// Sleep the plan backoff for `attempt`. False when cancelled first.
    async fn sleep_backoff(&self, cancel: &CancellationToken, plan: &NodePlan, attempt: u32) -> bool {
        let delay = self.backoff(plan, attempt);
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// `retry_backoff_ms * attempt`, or the default backoff when unset.
    pub fn backoff(&self, plan: &NodePlan, attempt: u32) -> Duration {
        match plan.policy.retry_backoff_ms {
            0 => self.default_backoff,
            unit => Duration::from_millis(unit.saturating_mul(u64::from(attempt.max(1)))),
        }
    }

    async fn publish(&self, status: &NodePlanStatus) {
        self.publisher.publish(status).await;
    }

    fn now(&self) -> u64 {
        (self.clock)()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_actions::MemorySupervisor;
    use keel_core::PlanPolicy;

    fn runner() -> Runner {
        Runner::new(
            "node-a",
            Arc::new(ActionRegistry::new()),
            Arc::new(MemorySupervisor::new()),
            VersionMarkers::new("/nonexistent"),
        )
    }

    #[test]
    fn test_backoff_linear_with_default() {
        let r = runner().with_default_backoff(Duration::from_millis(1500));
        let mut plan = NodePlan::default();
        assert_eq!(r.backoff(&plan, 3), Duration::from_millis(1500));

        plan.policy = PlanPolicy {
            retry_backoff_ms: 200,
            ..Default::default()
        };
        assert_eq!(r.backoff(&plan, 1), Duration::from_millis(200));
        assert_eq!(r.backoff(&plan, 3), Duration::from_millis(600));
        assert_eq!(r.backoff(&plan, 0), Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_terminal_replay_is_unchanged() {
        let r = runner();
        let plan = NodePlan {
            plan_id: "p".into(),
            generation: 4,
            ..Default::default()
        };
        let mut done = NodePlanStatus::for_plan(&plan, "node-a", 10);
        done.state = PlanState::Failed;
        done.error_message = "boom".into();

        let (status, result) = r
            .reconcile_plan(&CancellationToken::new(), &plan, Some(done.clone()))
            .await;
        assert_eq!(status, done);
        assert!(matches!(
            result,
            Err(RunnerError::Terminal {
                state: PlanState::Failed
            })
        ));
    }
}
