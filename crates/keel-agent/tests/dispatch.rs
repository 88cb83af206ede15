use async_trait::async_trait;
use keel_actions::builtin::ProbeSuccess;
use keel_actions::{Action, ActionContext, ActionError, ActionRegistry, MemorySupervisor, VersionMarkers};
use keel_agent::{
    AgentState, DispatchError, Dispatcher, FilePlanStore, MemoryPlanStore, PlanStore,
    StorePublisher, plan_lock_key,
};
use keel_core::{Args, Clock, NodePlan, NodePlanStatus, PlanSpec, PlanState, PlanStep};
use keel_lock::{LeaseLockProvider, LockError, LockGuard, LockProvider};
use keel_report::{ControllerClient, ControllerConnector, ReportError, StatusReporter};
use keel_runtime::Runner;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Counts calls and succeeds.
#[derive(Default)]
struct Counter {
    calls: AtomicUsize,
}

#[async_trait]
impl Action for Counter {
    fn name(&self) -> &str {
        "test.count"
    }

    fn validate(&self, _args: &Args) -> Result<(), ActionError> {
        Ok(())
    }

    async fn apply(&self, _ctx: &ActionContext, _args: &Args) -> Result<String, ActionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok("counted".to_string())
    }
}

/// Never grants a lock.
struct DenyAll;

#[async_trait]
impl LockProvider for DenyAll {
    async fn acquire_lock(
        &self,
        _resource_key: &str,
        _holder_id: &str,
        _ttl: Duration,
    ) -> Result<Option<LockGuard>, LockError> {
        Ok(None)
    }
}

/// Fails every acquisition with a backend error.
struct Broken;

#[async_trait]
impl LockProvider for Broken {
    async fn acquire_lock(
        &self,
        _resource_key: &str,
        _holder_id: &str,
        _ttl: Duration,
    ) -> Result<Option<LockGuard>, LockError> {
        Err(LockError::Unavailable("busy".to_string()))
    }
}

/// Controller that accepts every report and keeps it.
#[derive(Default)]
struct Sink {
    reports: Mutex<Vec<NodePlanStatus>>,
}

#[async_trait]
impl ControllerClient for Sink {
    async fn report_plan_status(&self, status: &NodePlanStatus) -> Result<(), tonic::Status> {
        self.reports.lock().unwrap().push(status.clone());
        Ok(())
    }
}

struct SinkConnector(Arc<Sink>);

#[async_trait]
impl ControllerConnector for SinkConnector {
    async fn connect(&self, _endpoint: &str) -> Result<Arc<dyn ControllerClient>, ReportError> {
        Ok(self.0.clone())
    }
}

fn fixed_clock(ms: &Arc<AtomicU64>) -> Clock {
    let ms = ms.clone();
    Arc::new(move || ms.load(Ordering::SeqCst))
}

struct Harness {
    store: Arc<MemoryPlanStore>,
    counter: Arc<Counter>,
    dispatcher: Dispatcher,
}

fn harness(node: &str, locks: Arc<dyn LockProvider>) -> Harness {
    let store = Arc::new(MemoryPlanStore::new());
    let counter = Arc::new(Counter::default());
    let mut registry = ActionRegistry::new().with(ProbeSuccess);
    registry.register(counter.clone());
    let runner = Runner::new(
        node,
        Arc::new(registry),
        Arc::new(MemorySupervisor::new()),
        VersionMarkers::new("/nonexistent"),
    )
    .with_publisher(Arc::new(StorePublisher::new(node, store.clone())))
    .with_default_backoff(Duration::from_millis(10));
    let dispatcher = Dispatcher::new(store.clone(), locks, runner);
    Harness {
        store,
        counter,
        dispatcher,
    }
}

fn plan(node: &str, generation: u64, locks: &[&str]) -> NodePlan {
    NodePlan {
        plan_id: format!("plan-{generation}"),
        node_id: node.to_string(),
        generation,
        locks: locks.iter().map(|l| l.to_string()).collect(),
        spec: PlanSpec {
            steps: vec![PlanStep {
                id: "count".into(),
                action: "test.count".into(),
                ..Default::default()
            }],
            ..Default::default()
        },
        ..Default::default()
    }
}

#[tokio::test]
async fn test_lock_conflict_fails_without_running() {
    let h = harness("node-a", Arc::new(DenyAll));
    let cancel = CancellationToken::new();

    let (status, result) = h
        .dispatcher
        .run_stored_plan(&cancel, &plan("node-a", 1, &["service:gateway"]), None)
        .await;

    assert!(matches!(result, Err(DispatchError::LockConflict { .. })));
    assert_eq!(status.state, PlanState::Failed);
    assert!(status.error_message.starts_with("LOCK_CONFLICT"), "{}", status.error_message);
    assert!(status.current_step_id.is_empty());
    assert!(status.steps.is_empty());
    assert!(status.finished_ms > 0);
    assert_eq!(h.counter.calls.load(Ordering::SeqCst), 0);

    let stored = h.store.get_status("node-a").await.unwrap().unwrap();
    assert_eq!(stored.state, PlanState::Failed);
    // Lock failures are not a finished generation.
    assert_eq!(h.dispatcher.last_plan_generation(), 0);
}

#[tokio::test]
async fn test_lock_backend_error_is_reported_as_conflict() {
    let h = harness("node-a", Arc::new(Broken));
    let cancel = CancellationToken::new();

    let (status, result) = h
        .dispatcher
        .run_stored_plan(&cancel, &plan("node-a", 1, &["dns"]), None)
        .await;

    let err = result.unwrap_err();
    assert!(err.is_lock_failure());
    assert!(matches!(err, DispatchError::LockUnavailable { .. }));
    assert_eq!(status.state, PlanState::Failed);
    assert!(status.error_message.starts_with("LOCK_CONFLICT"));
    assert!(status.error_message.contains("busy"), "{}", status.error_message);
    assert!(status.steps.is_empty());
    assert_eq!(h.counter.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_plan_without_locks_runs() {
    let h = harness("node-a", Arc::new(DenyAll));
    let cancel = CancellationToken::new();

    let (status, result) = h
        .dispatcher
        .run_stored_plan(&cancel, &plan("node-a", 3, &[]), None)
        .await;

    assert!(result.is_ok());
    assert_eq!(status.state, PlanState::Succeeded);
    assert_eq!(h.counter.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.dispatcher.last_plan_generation(), 3);
}

#[tokio::test]
async fn test_partial_locks_released_on_conflict() {
    let locks = LeaseLockProvider::new();
    let other = locks
        .acquire_lock(&plan_lock_key("b"), "node-b", Duration::from_secs(30))
        .await
        .unwrap()
        .expect("node-b takes b");

    let h = harness("node-a", Arc::new(locks.clone()));
    let cancel = CancellationToken::new();
    let (status, result) = h
        .dispatcher
        .run_stored_plan(&cancel, &plan("node-a", 1, &["b", "a"]), None)
        .await;

    assert!(matches!(result, Err(DispatchError::LockConflict { .. })));
    assert_eq!(status.error_message, "LOCK_CONFLICT: a, b");
    assert_eq!(locks.holder(&plan_lock_key("a")), None);
    assert_eq!(locks.holder(&plan_lock_key("b")).as_deref(), Some("node-b"));

    drop(other);
    let (status, result) = h
        .dispatcher
        .run_stored_plan(&cancel, &plan("node-a", 1, &["b", "a"]), None)
        .await;
    assert!(result.is_ok());
    assert_eq!(status.state, PlanState::Succeeded);
    assert_eq!(locks.holder(&plan_lock_key("a")), None);
    assert_eq!(locks.holder(&plan_lock_key("b")), None);
}

#[tokio::test]
async fn test_two_nodes_contend_for_shared_lock() {
    let locks = LeaseLockProvider::new();
    let a = harness("node-a", Arc::new(locks.clone()));
    let b = harness("node-b", Arc::new(locks.clone()));
    let cancel = CancellationToken::new();

    let held = a
        .dispatcher
        .acquire_plan_locks(&cancel, &plan("node-a", 1, &["service:gateway"]))
        .await
        .unwrap();
    assert_eq!(held.len(), 1);

    let (status, _) = b
        .dispatcher
        .run_stored_plan(&cancel, &plan("node-b", 1, &["service:gateway"]), None)
        .await;
    assert_eq!(status.state, PlanState::Failed);
    assert_eq!(b.counter.calls.load(Ordering::SeqCst), 0);

    drop(held);
    let (status, _) = b
        .dispatcher
        .run_stored_plan(&cancel, &plan("node-b", 1, &["service:gateway"]), None)
        .await;
    assert_eq!(status.state, PlanState::Succeeded);
}

#[tokio::test]
async fn test_expired_plan_is_not_run() {
    let now = Arc::new(AtomicU64::new(5_000));
    let mut h = harness("node-a", Arc::new(LeaseLockProvider::new()));
    h.dispatcher = h.dispatcher.with_clock(fixed_clock(&now));

    let mut expired = plan("node-a", 1, &["dns"]);
    expired.expires_ms = 4_000;
    h.store.put_current_plan("node-a", &expired).await.unwrap();

    let status = h
        .dispatcher
        .poll_plan(&CancellationToken::new())
        .await
        .unwrap()
        .expect("expired plan produces a status");

    assert_eq!(status.state, PlanState::Expired);
    assert_eq!(status.error_message, "plan expired");
    assert_eq!(status.finished_ms, 5_000);
    assert_eq!(status.events.last().unwrap().msg, "plan expired before execution");
    assert_eq!(h.counter.calls.load(Ordering::SeqCst), 0);

    // Terminal for this generation: the next poll has nothing to do.
    let again = h.dispatcher.poll_plan(&CancellationToken::new()).await.unwrap();
    assert!(again.is_none());
}

#[tokio::test]
async fn test_poll_runs_once_per_generation() {
    let h = harness("node-a", Arc::new(LeaseLockProvider::new()));
    let cancel = CancellationToken::new();

    assert!(h.dispatcher.poll_plan(&cancel).await.unwrap().is_none());

    h.dispatcher.submit_plan(plan("node-a", 0, &[])).await.unwrap();
    let first = h.dispatcher.poll_plan(&cancel).await.unwrap().unwrap();
    assert_eq!(first.state, PlanState::Succeeded);
    assert_eq!(first.generation, 1);

    assert!(h.dispatcher.poll_plan(&cancel).await.unwrap().is_none());
    assert_eq!(h.counter.calls.load(Ordering::SeqCst), 1);

    let next = h.dispatcher.submit_plan(plan("node-a", 0, &[])).await.unwrap();
    assert_eq!(next.generation, 2);
    let second = h.dispatcher.poll_plan(&cancel).await.unwrap().unwrap();
    assert_eq!(second.generation, 2);
    assert_eq!(second.state, PlanState::Succeeded);
    assert_eq!(h.counter.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_submit_assigns_identity() {
    let h = harness("node-a", Arc::new(LeaseLockProvider::new()));

    let mut anonymous = plan("", 0, &[]);
    anonymous.plan_id.clear();
    let stored = h.dispatcher.submit_plan(anonymous).await.unwrap();
    assert_eq!(stored.node_id, "node-a");
    assert!(!stored.plan_id.is_empty());
    assert_eq!(stored.generation, 1);
    assert!(stored.created_ms > 0);

    let explicit = h.dispatcher.submit_plan(plan("node-a", 7, &[])).await.unwrap();
    assert_eq!(explicit.generation, 7);

    let next = h.dispatcher.submit_plan(plan("node-a", 0, &[])).await.unwrap();
    assert_eq!(next.generation, 8);

    let history: Vec<u64> = h.store.history("node-a").iter().map(|p| p.generation).collect();
    assert_eq!(history, vec![1, 7, 8]);
}

#[tokio::test]
async fn test_submit_rejects_foreign_plan() {
    let h = harness("node-a", Arc::new(LeaseLockProvider::new()));
    let err = h
        .dispatcher
        .submit_plan(plan("node-b", 1, &[]))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::ForeignNode { .. }));
    assert!(h.store.get_current_plan("node-a").await.unwrap().is_none());
}

#[tokio::test]
async fn test_terminal_status_is_reported() {
    let sink = Arc::new(Sink::default());
    let reporter = StatusReporter::new(Arc::new(SinkConnector(sink.clone())), "controller:9090");
    let mut h = harness("node-a", Arc::new(DenyAll));
    h.dispatcher = h.dispatcher.with_reporter(Arc::new(reporter));
    let cancel = CancellationToken::new();

    h.dispatcher
        .run_stored_plan(&cancel, &plan("node-a", 1, &[]), None)
        .await;
    h.dispatcher
        .run_stored_plan(&cancel, &plan("node-a", 2, &["dns"]), None)
        .await;

    let reports = sink.reports.lock().unwrap();
    let states: Vec<PlanState> = reports.iter().map(|s| s.state).collect();
    assert_eq!(states, vec![PlanState::Succeeded, PlanState::Failed]);
}

#[tokio::test]
async fn test_generation_persisted_to_state_file() {
    let dir = tempfile::tempdir().unwrap();
    let state_file = dir.path().join("state.json");
    let mut h = harness("node-a", Arc::new(LeaseLockProvider::new()));
    h.dispatcher = h.dispatcher.with_state(AgentState::default(), &state_file);

    h.dispatcher
        .run_stored_plan(&CancellationToken::new(), &plan("node-a", 4, &[]), None)
        .await;

    let state = AgentState::load(&state_file).unwrap();
    assert_eq!(state.last_plan_generation, 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_state_file_only_moves_forward() {
    let dir = tempfile::tempdir().unwrap();
    let state_file = dir.path().join("nested").join("state.json");
    let mut h = harness("node-a", Arc::new(LeaseLockProvider::new()));
    h.dispatcher = h
        .dispatcher
        .with_state(AgentState { last_plan_generation: 2 }, &state_file);
    let cancel = CancellationToken::new();

    h.dispatcher
        .run_stored_plan(&cancel, &plan("node-a", 1, &[]), None)
        .await;
    assert!(!state_file.exists());

    h.dispatcher
        .run_stored_plan(&cancel, &plan("node-a", 6, &[]), None)
        .await;
    h.dispatcher
        .run_stored_plan(&cancel, &plan("node-a", 5, &[]), None)
        .await;

    assert_eq!(h.dispatcher.last_plan_generation(), 6);
    assert_eq!(AgentState::load(&state_file).unwrap().last_plan_generation, 6);
    assert!(!state_file.with_extension("json.tmp").exists());
}

#[tokio::test]
async fn test_file_store_round_trip_through_dispatcher() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn PlanStore> = Arc::new(FilePlanStore::new(dir.path()));
    let registry = ActionRegistry::new().with(ProbeSuccess);
    let runner = Runner::new(
        "node-a",
        Arc::new(registry),
        Arc::new(MemorySupervisor::new()),
        VersionMarkers::new(dir.path()),
    )
    .with_publisher(Arc::new(StorePublisher::new("node-a", store.clone())));
    let dispatcher = Dispatcher::new(store.clone(), Arc::new(LeaseLockProvider::new()), runner);

    let mut p = plan("node-a", 0, &["dns"]);
    p.spec.steps[0].action = "probe.success".into();
    dispatcher.submit_plan(p).await.unwrap();
    let status = dispatcher
        .poll_plan(&CancellationToken::new())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status.state, PlanState::Succeeded);

    let stored = store.get_status("node-a").await.unwrap().unwrap();
    assert_eq!(stored, status);
}

#[tokio::test(start_paused = true)]
async fn test_poll_loop_stops_on_cancel() {
    let h = harness("node-a", Arc::new(LeaseLockProvider::new()));
    h.dispatcher.submit_plan(plan("node-a", 0, &[])).await.unwrap();
    let dispatcher = Arc::new(h.dispatcher);
    let cancel = CancellationToken::new();

    let task = {
        let dispatcher = dispatcher.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            dispatcher
                .run_poll_loop(&cancel, Duration::from_millis(100))
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(350)).await;
    cancel.cancel();
    task.await.unwrap();

    // Four ticks, one run: later polls see the terminal status.
    assert_eq!(h.counter.calls.load(Ordering::SeqCst), 1);
    assert_eq!(dispatcher.last_plan_generation(), 1);
}
