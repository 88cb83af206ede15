//! CLI command implementations for the keel agent.

pub mod plan;
pub mod run;
pub mod status;

use anyhow::{Context, Result};
use keel_actions::builtin::register_builtins;
use keel_actions::{ActionRegistry, Supervisor, SystemctlSupervisor, VersionMarkers};
use keel_agent::{AgentState, Dispatcher, FilePlanStore, PlanStore, StorePublisher};
use keel_core::AgentConfig;
use keel_lock::LeaseLockProvider;
use keel_report::{HttpControllerConnector, StatusReporter};
use keel_runtime::Runner;
use std::sync::Arc;

/// Registry with every built-in handler, backed by systemd.
pub fn registry(markers: VersionMarkers) -> (ActionRegistry, Arc<dyn Supervisor>) {
    let supervisor: Arc<dyn Supervisor> = Arc::new(SystemctlSupervisor::default());
    let mut registry = ActionRegistry::new();
    register_builtins(&mut registry, supervisor.clone(), markers);
    (registry, supervisor)
}

pub fn plan_store(config: &AgentConfig) -> Arc<dyn PlanStore> {
    Arc::new(FilePlanStore::new(config.plan_store_dir()))
}

/// Wire the dispatcher from configuration.
pub fn dispatcher(config: &AgentConfig) -> Result<Dispatcher> {
    let store = plan_store(config);
    let markers = VersionMarkers::new(&config.version_marker_dir);
    let (registry, supervisor) = registry(markers.clone());
    tracing::debug!(actions = ?registry.names(), "action registry ready");

    let runner = Runner::new(config.node_id.as_str(), Arc::new(registry), supervisor, markers)
        .with_publisher(Arc::new(StorePublisher::new(
            config.node_id.as_str(),
            store.clone(),
        )))
        .with_default_backoff(config.default_backoff());

    let state_file = config.state_file();
    let state = AgentState::load(&state_file)
        .with_context(|| format!("load agent state from {}", state_file.display()))?;

    let mut dispatcher = Dispatcher::new(store, Arc::new(LeaseLockProvider::new()), runner)
        .with_lock_ttl(config.plan_lock_ttl())
        .with_state(state, state_file);

    if !config.controller_endpoint.trim().is_empty() {
        let connector = HttpControllerConnector::new(config.report_timeout())?;
        let reporter = StatusReporter::new(Arc::new(connector), config.controller_endpoint.as_str())
            .with_timeout(config.report_timeout());
        dispatcher = dispatcher.with_reporter(Arc::new(reporter));
    } else {
        tracing::info!("no controller endpoint configured; status reporting disabled");
    }
    Ok(dispatcher)
}
