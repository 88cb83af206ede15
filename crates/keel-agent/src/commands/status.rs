//! `keel-agent status`

use anyhow::Result;
use keel_core::AgentConfig;

pub async fn show(config: AgentConfig) -> Result<()> {
    let store = super::plan_store(&config);
    match store.get_status(&config.node_id).await? {
        Some(status) => println!("{}", serde_json::to_string_pretty(&status)?),
        None => println!("no plan status recorded for {}", config.node_id),
    }
    Ok(())
}
