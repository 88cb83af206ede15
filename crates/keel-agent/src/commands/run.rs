//! `keel-agent run`

use anyhow::Result;
use keel_core::AgentConfig;
use tokio_util::sync::CancellationToken;

pub async fn run(config: AgentConfig) -> Result<()> {
    let dispatcher = super::dispatcher(&config)?;
    let cancel = CancellationToken::new();

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received; stopping");
        }
        shutdown.cancel();
    });

    tracing::info!(
        node_id = %config.node_id,
        cluster_id = %config.cluster_id,
        state_dir = %config.state_dir.display(),
        "keel agent starting"
    );
    dispatcher
        .run_poll_loop(&cancel, config.plan_poll_interval())
        .await;
    Ok(())
}
