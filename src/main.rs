use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

mod cmd;

#[derive(Parser)]
#[command(name = "listing-pipeline")]
#[command(version, about = "Advance product records through the listing readiness pipeline")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Decide every gate automatically (first candidate, approve)
    #[arg(long, global = true)]
    pub yes: bool,

    /// JSON file holding the records
    #[arg(long, global = true, default_value = "records.json")]
    pub records: PathBuf,

    /// Path to listing-pipeline.toml. Defaults to the current directory's.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show the execution plan for the selected records
    Plan {
        /// Stop once records reach this phase
        #[arg(long)]
        target: Option<String>,
        /// Comma-separated record ids (default: all)
        #[arg(long, value_delimiter = ',')]
        ids: Vec<String>,
        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show each record's phase and what it needs next
    Status {
        #[arg(long, value_delimiter = ',')]
        ids: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    /// Run the pipeline over the selected records and save the result
    Run {
        #[arg(long)]
        target: Option<String>,
        #[arg(long, value_delimiter = ',')]
        ids: Vec<String>,
        /// Per-bucket concurrency. Overrides listing-pipeline.toml.
        #[arg(long)]
        max_concurrency: Option<usize>,
        /// Per-record operation timeout in seconds. Overrides listing-pipeline.toml.
        #[arg(long)]
        timeout_secs: Option<u64>,
        /// UI mode: full, minimal, json
        #[arg(long, default_value = "full")]
        ui: String,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default listing-pipeline.toml file
    Init,
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "listing_pipeline=debug"
    } else {
        "warn"
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match &cli.command {
        Commands::Plan { target, ids, json } => {
            cmd::cmd_plan(&cli, target.as_deref(), ids, *json)?
        }
        Commands::Status { ids, json } => cmd::cmd_status(&cli, ids, *json)?,
        Commands::Run {
            target,
            ids,
            max_concurrency,
            timeout_secs,
            ui,
        } => {
            let overrides = cmd::RunOverrides {
                max_concurrency: *max_concurrency,
                timeout_secs: *timeout_secs,
            };
            cmd::cmd_run(&cli, target.as_deref(), ids, overrides, ui).await?
        }
        Commands::Config { command } => cmd::cmd_config(&cli, command.clone())?,
    }

    Ok(())
}
