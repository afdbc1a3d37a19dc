use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod cmd;

use thinktank::config::{DEFAULT_DATA_DIR, ThinktankConfig};

#[derive(Parser)]
#[command(name = "thinktank")]
#[command(version, about = "Run a problem through a multi-model reasoning pipeline")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Directory holding thinktank.toml and the stored session
    #[arg(long, global = true, default_value = DEFAULT_DATA_DIR)]
    pub data_dir: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the active workflow offline, answering every request with a preview
    Preview {
        /// The problem statement
        #[arg(short, long)]
        problem: String,

        /// Run this workflow instead of the active one
        #[arg(short, long)]
        workflow: Option<String>,

        /// Agent model for this run (repeatable). Overrides thinktank.toml
        #[arg(long = "agent")]
        agents: Vec<String>,

        /// Attempts per request. Overrides thinktank.toml
        #[arg(long)]
        retries: Option<u32>,

        /// Make a single attempt per request
        #[arg(long)]
        no_retry: bool,
    },
    /// Show the stages and request count of the active workflow
    Plan,
    /// Inspect or clear run history
    History {
        #[command(subcommand)]
        command: Option<HistoryCommands>,
    },
    /// List or switch workflows
    Workflows {
        #[command(subcommand)]
        command: Option<WorkflowCommands>,
    },
    /// Edit the active stage list
    Stages {
        #[command(subcommand)]
        command: StageCommands,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum HistoryCommands {
    /// List stored runs, newest first
    List,
    /// Show one run
    Show {
        run_id: String,
        /// Include every unit's output
        #[arg(long)]
        outputs: bool,
    },
    /// Select a run and make its stages the active stage list
    Load { run_id: String },
    /// Remove every stored run
    Clear,
}

#[derive(Subcommand, Clone)]
pub enum WorkflowCommands {
    /// List workflows
    List,
    /// Make a workflow active
    Select { workflow_id: String },
    /// Create a workflow and make it active
    Create {
        #[arg(long)]
        name: String,
        #[arg(long)]
        description: Option<String>,
        /// Stage as KIND:NAME:PROMPT (repeatable, in order)
        #[arg(long = "stage", required = true)]
        stages: Vec<String>,
    },
}

#[derive(Subcommand, Clone)]
pub enum StageCommands {
    /// Enable or disable a stage
    Toggle { stage_id: String },
    /// Replace a stage's system prompt
    Prompt { stage_id: String, prompt: String },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default thinktank.toml file
    Init,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .ok();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = ThinktankConfig::new(cli.data_dir.clone())
        .context("Failed to load configuration")?
        .with_verbose(cli.verbose);

    match &cli.command {
        Commands::Preview {
            problem,
            workflow,
            agents,
            retries,
            no_retry,
        } => {
            if !agents.is_empty() {
                config.cli_agents = Some(agents.clone());
            }
            config.cli_retry_threshold = *retries;
            config.cli_no_retry = *no_retry;
            cmd::cmd_preview(&config, problem, workflow.as_deref()).await?;
        }
        Commands::Plan => cmd::cmd_plan(&config)?,
        Commands::History { command } => cmd::cmd_history(&config, command.clone()).await?,
        Commands::Workflows { command } => cmd::cmd_workflows(&config, command.clone())?,
        Commands::Stages { command } => cmd::cmd_stages(&config, command.clone())?,
        Commands::Config { command } => cmd::cmd_config(&config, command.clone())?,
    }

    Ok(())
}
