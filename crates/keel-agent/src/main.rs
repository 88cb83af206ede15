use anyhow::Result;
use clap::{Parser, Subcommand};
use keel_core::AgentConfig;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser, Debug)]
#[command(name = "keel-agent", version, about = "Keel node agent")]
struct Cli {
    /// Agent configuration file (YAML)
    #[arg(long, short, env = "KEEL_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll the plan store and reconcile plans until interrupted
    Run,

    /// Plan operations
    Plan {
        #[command(subcommand)]
        cmd: PlanCommand,
    },

    /// Print the stored status of this node's current plan
    Status,
}

#[derive(Subcommand, Debug)]
enum PlanCommand {
    /// Check that every action and condition in a plan is registered and well-formed
    Validate {
        /// Path to plan.yaml or plan.json
        file: PathBuf,
    },

    /// Store a plan as this node's current plan
    Apply { file: PathBuf },

    /// Store a plan and reconcile it once in the foreground
    Run { file: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // `plan validate` works without a node identity.
    if let Command::Plan {
        cmd: PlanCommand::Validate { file },
    } = &cli.cmd
    {
        init_tracing("info");
        return commands::plan::validate(file);
    }

    let config = AgentConfig::load(cli.config.as_deref())?;
    init_tracing(&config.log_level);

    match cli.cmd {
        Command::Run => commands::run::run(config).await?,
        Command::Plan { cmd } => match cmd {
            PlanCommand::Validate { file } => commands::plan::validate(&file)?,
            PlanCommand::Apply { file } => commands::plan::apply(config, &file).await?,
            PlanCommand::Run { file } => commands::plan::run_once(config, &file).await?,
        },
        Command::Status => commands::status::show(config).await?,
    }

    Ok(())
}

/// `RUST_LOG` wins over the configured level.
fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
