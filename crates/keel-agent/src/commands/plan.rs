//! `keel-agent plan ...`

use anyhow::{Context, Result, bail};
use keel_actions::VersionMarkers;
use keel_agent::check_plan;
use keel_core::{AgentConfig, NodePlan, PlanState};
use std::path::Path;
use tokio_util::sync::CancellationToken;

fn load(file: &Path) -> Result<NodePlan> {
    NodePlan::from_file(file).with_context(|| format!("read plan {}", file.display()))
}

pub fn validate(file: &Path) -> Result<()> {
    let plan = load(file)?;
    let (registry, _) = super::registry(VersionMarkers::new("/var/lib/keel/services"));
    let issues = check_plan(&registry, &plan);
    if issues.is_empty() {
        println!(
            "{}: ok ({} steps, {} rollback steps, {} probes)",
            file.display(),
            plan.spec.steps.len(),
            plan.spec.rollback.len(),
            plan.spec.success_probes.len()
        );
        return Ok(());
    }
    for issue in &issues {
        eprintln!("  {issue}");
    }
    bail!("{}: {} problem(s) found", file.display(), issues.len())
}

pub async fn apply(config: AgentConfig, file: &Path) -> Result<()> {
    let plan = load(file)?;
    let dispatcher = super::dispatcher(&config)?;
    let stored = dispatcher.submit_plan(plan).await?;
    println!("plan_id={} generation={}", stored.plan_id, stored.generation);
    Ok(())
}

pub async fn run_once(config: AgentConfig, file: &Path) -> Result<()> {
    let plan = load(file)?;
    let dispatcher = super::dispatcher(&config)?;
    let stored = dispatcher.submit_plan(plan).await?;
    tracing::info!(plan_id = %stored.plan_id, generation = stored.generation, "running plan");

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    match dispatcher.poll_plan(&cancel).await? {
        Some(status) => {
            println!("{}", serde_json::to_string_pretty(&status)?);
            if status.state != PlanState::Succeeded {
                bail!("plan finished in state {}", status.state);
            }
        }
        None => println!("nothing to do"),
    }
    Ok(())
}
