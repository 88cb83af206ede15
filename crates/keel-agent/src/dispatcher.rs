//! Plan dispatch: submission, lock acquisition, expiry and the poll loop.

use keel_core::{Clock, EventLevel, NodePlan, NodePlanStatus, PlanState, system_clock};
use keel_lock::{LockError, LockGuard, LockProvider};
use keel_report::StatusReporter;
use keel_runtime::Runner;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::DispatchError;
use crate::state::AgentState;
use crate::store::PlanStore;

pub const LOCK_KEY_PREFIX: &str = "plans/v1/locks";

/// Fleet-wide key for a plan lock; two nodes naming the same lock contend.
pub fn plan_lock_key(lock: &str) -> String {
    format!("{LOCK_KEY_PREFIX}/{lock}")
}

pub struct Dispatcher {
    node_id: String,
    store: Arc<dyn PlanStore>,
    locks: Arc<dyn LockProvider>,
    runner: Runner,
    reporter: Option<Arc<StatusReporter>>,
    lock_ttl: Duration,
    clock: Clock,
    state: Mutex<AgentState>,
    state_path: Option<PathBuf>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn PlanStore>,
        locks: Arc<dyn LockProvider>,
        runner: Runner,
    ) -> Self {
        Self {
            node_id: runner.node_id().to_string(),
            store,
            locks,
            runner,
            reporter: None,
            lock_ttl: Duration::from_secs(30),
            clock: system_clock(),
            state: Mutex::new(AgentState::default()),
            state_path: None,
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<StatusReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Start from `state` and persist updates to `path`.
    pub fn with_state(mut self, state: AgentState, path: impl Into<PathBuf>) -> Self {
        self.state = Mutex::new(state);
        self.state_path = Some(path.into());
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn last_plan_generation(&self) -> u64 {
        self.state
            .lock()
            .map(|s| s.last_plan_generation)
            .unwrap_or_default()
    }

    /// Accept a plan for this node and make it the current plan.
    ///
    /// Fills in node id, plan id, generation and creation time when absent.
    /// Generation 0 means "next": one past the highest generation seen in
    /// agent state, the stored status and the stored plan.
    pub async fn submit_plan(&self, mut plan: NodePlan) -> Result<NodePlan, DispatchError> {
        if plan.node_id.trim().is_empty() {
            plan.node_id = self.node_id.clone();
        }
        if plan.node_id != self.node_id {
            return Err(DispatchError::ForeignNode {
                plan_node: plan.node_id,
                node_id: self.node_id.clone(),
            });
        }
        if plan.plan_id.trim().is_empty() {
            plan.plan_id = Uuid::new_v4().to_string();
        }
        if plan.generation == 0 {
            let status_gen = self
                .store
                .get_status(&self.node_id)
                .await?
                .map(|s| s.generation)
                .unwrap_or(0);
            let plan_gen = self
                .store
                .get_current_plan(&self.node_id)
                .await?
                .map(|p| p.generation)
                .unwrap_or(0);
            plan.generation = self.last_plan_generation().max(status_gen).max(plan_gen) + 1;
        }
        if plan.created_ms == 0 {
            plan.created_ms = self.now();
        }

        self.store.put_current_plan(&self.node_id, &plan).await?;
        self.store.append_history(&self.node_id, &plan).await?;
        tracing::info!(
            node_id = %self.node_id,
            plan_id = %plan.plan_id,
            generation = plan.generation,
            "plan stored"
        );
        Ok(plan)
    }

    /// Acquire every lock the plan names, in sorted order, or none of them.
    pub async fn acquire_plan_locks(
        &self,
        cancel: &CancellationToken,
        plan: &NodePlan,
    ) -> Result<Vec<LockGuard>, DispatchError> {
        let locks = plan.sorted_locks();
        let mut held = Vec::with_capacity(locks.len());
        for lock in &locks {
            let key = plan_lock_key(lock);
            let acquired = tokio::select! {
                _ = cancel.cancelled() => Err(LockError::Cancelled),
                res = self.locks.acquire_lock(&key, &self.node_id, self.lock_ttl) => res,
            };
            match acquired {
                Ok(Some(guard)) => held.push(guard),
                Ok(None) => {
                    tracing::warn!(plan_id = %plan.plan_id, lock = %lock, "plan lock busy");
                    return Err(DispatchError::LockConflict {
                        locks: locks.clone(),
                    });
                }
                Err(source) => {
                    tracing::warn!(plan_id = %plan.plan_id, lock = %lock, error = %source, "plan lock failed");
                    return Err(DispatchError::LockUnavailable {
                        locks: locks.clone(),
                        source,
                    });
                }
            }
        }
        Ok(held)
    }

    /// Run `plan` under its locks.
    ///
    /// When the locks cannot be taken the runner is never invoked: the status
    /// is FAILED with no steps and the lock error as its message.
    pub async fn run_stored_plan(
        &self,
        cancel: &CancellationToken,
        plan: &NodePlan,
        current: Option<NodePlanStatus>,
    ) -> (NodePlanStatus, Result<(), DispatchError>) {
        let guards = match self.acquire_plan_locks(cancel, plan).await {
            Ok(guards) => guards,
            Err(err) => {
                let now = self.now();
                let mut status = NodePlanStatus::for_plan(plan, &self.node_id, now);
                status.state = PlanState::Failed;
                status.finished_ms = now;
                status.error_message = err.to_string();
                status.push_event(now, EventLevel::Error, status.error_message.clone(), "");
                self.publish(&status).await;
                self.report(&status).await;
                return (status, Err(err));
            }
        };

        let (status, result) = self.runner.reconcile_plan(cancel, plan, current).await;
        drop(guards);

        if status.is_terminal() {
            self.record_generation(plan.generation).await;
            self.report(&status).await;
        }
        (status, result.map_err(DispatchError::from))
    }

    /// Record an EXPIRED status without taking locks or running anything.
    pub async fn mark_plan_expired(&self, plan: &NodePlan) -> NodePlanStatus {
        let now = self.now();
        let mut status = NodePlanStatus::for_plan(plan, &self.node_id, now);
        status.state = PlanState::Expired;
        status.finished_ms = now;
        status.error_message = "plan expired".to_string();
        status.push_event(now, EventLevel::Warn, "plan expired before execution", "");
        tracing::warn!(
            plan_id = %plan.plan_id,
            generation = plan.generation,
            expires_ms = plan.expires_ms,
            "plan expired before execution"
        );
        self.publish(&status).await;
        self.report(&status).await;
        status
    }

    /// One poll: load the current plan and run it unless it is done.
    ///
    /// Returns the resulting status, or `None` when there was nothing to do.
    /// Plan failures are logged; only store errors are returned.
    pub async fn poll_plan(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<NodePlanStatus>, DispatchError> {
        let Some(plan) = self.store.get_current_plan(&self.node_id).await? else {
            return Ok(None);
        };
        if !plan.node_id.is_empty() && plan.node_id != self.node_id {
            tracing::debug!(plan_node = %plan.node_id, "ignoring plan for another node");
            return Ok(None);
        }
        let status = match self.store.get_status(&self.node_id).await {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!(error = %e, "unreadable plan status; starting fresh");
                None
            }
        };
        if status
            .as_ref()
            .is_some_and(|s| s.generation == plan.generation && s.is_terminal())
        {
            return Ok(None);
        }
        if plan.is_expired(self.now()) {
            return Ok(Some(self.mark_plan_expired(&plan).await));
        }

        let (status, result) = self.run_stored_plan(cancel, &plan, status).await;
        if let Err(e) = result {
            tracing::warn!(
                plan_id = %plan.plan_id,
                generation = plan.generation,
                state = %status.state,
                error = %e,
                "plan run ended without success"
            );
        }
        Ok(Some(status))
    }

    /// Poll every `interval` until `cancel` fires. The first poll is immediate.
    pub async fn run_poll_loop(&self, cancel: &CancellationToken, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(node_id = %self.node_id, interval_ms = interval.as_millis() as u64, "plan poll loop started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_plan(cancel).await {
                        tracing::warn!(error = %e, "plan poll failed");
                    }
                }
            }
        }
        tracing::info!(node_id = %self.node_id, "plan poll loop stopped");
    }

    async fn publish(&self, status: &NodePlanStatus) {
        if let Err(e) = self.store.put_status(&self.node_id, status).await {
            tracing::warn!(plan_id = %status.plan_id, error = %e, "failed to publish plan status");
        }
    }

    async fn report(&self, status: &NodePlanStatus) {
        let Some(reporter) = &self.reporter else {
            return;
        };
        if let Err(e) = reporter.send_status(status).await {
            tracing::warn!(
                plan_id = %status.plan_id,
                state = %status.state,
                error = %e,
                "status report failed"
            );
        }
    }

    /// Raise the recorded generation, then persist a snapshot with the
    /// state lock released.
    async fn record_generation(&self, generation: u64) {
        let snapshot = {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            if generation <= state.last_plan_generation {
                return;
            }
            state.last_plan_generation = generation;
            *state
        };
        if let Some(path) = &self.state_path {
            if let Err(e) = snapshot.save(path).await {
                tracing::warn!(path = %path.display(), error = %e, "save agent state");
            }
        }
    }

    fn now(&self) -> u64 {
        (self.clock)()
    }
}
