use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;

use loanflow::config::Config;

mod cmd;

#[derive(Parser)]
#[command(name = "loanflow")]
#[command(version, about = "Loan-document workflow orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to the pipeline config. Defaults to ./loanflow.toml when present.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory for run status files. Overrides loanflow.toml and LOANFLOW_OUTPUT_DIR.
    #[arg(long, global = true)]
    pub output_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the pipeline for a subject and wait for it to finish
    Run {
        #[command(flatten)]
        args: RunArgs,

        /// Resume an existing run at this stage. Mode, retries and params
        /// stay as the run was created with.
        #[arg(
            long,
            requires = "run_id",
            conflicts_with_all = ["live", "max_retries", "params"]
        )]
        resume_from: Option<String>,

        /// Run to resume (with --resume-from)
        #[arg(long, requires = "resume_from")]
        run_id: Option<String>,
    },
    /// Start the pipeline in the background and print the run id
    Dispatch {
        #[command(flatten)]
        args: RunArgs,
    },
    /// Execute a dispatched run (used by `dispatch`)
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        run_id: String,
    },
    /// Show the status of a run
    Status {
        run_id: String,

        /// Print the raw run record as JSON
        #[arg(long)]
        json: bool,
    },
    /// List runs, newest first
    List {
        /// Print the listing as JSON
        #[arg(long)]
        json: bool,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

/// Options shared by `run` and `dispatch`.
#[derive(Args, Clone, Debug)]
pub struct RunArgs {
    /// Subject (loan) identifier
    pub subject_id: String,

    /// Act on live systems instead of simulating
    #[arg(long)]
    pub live: bool,

    /// Retries per stage after the first attempt
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Skip these stages (comma-separated)
    #[arg(long, value_delimiter = ',', conflicts_with = "only")]
    pub skip: Vec<String>,

    /// Run only these stages (comma-separated)
    #[arg(long, value_delimiter = ',')]
    pub only: Vec<String>,

    /// Pause for review after this stage
    #[arg(long)]
    pub stop_after: Option<String>,

    /// Stage parameter as KEY=VALUE (repeatable); JSON values are parsed
    #[arg(long = "param", value_name = "KEY=VALUE", value_parser = parse_param)]
    pub params: Vec<(String, Value)>,
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a starter loanflow.toml
    Init,
}

fn parse_param(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", raw))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty key in '{}'", raw));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "loanflow=debug" } else { "loanflow=info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Commands::Config {
        command: Some(ConfigCommands::Init),
    } = &cli.command
    {
        return cmd::cmd_config_init(cli.config.as_deref());
    }

    let config = Config::load(cli.config.clone(), cli.output_dir.clone(), cli.verbose)?;

    match &cli.command {
        Commands::Run {
            args,
            resume_from,
            run_id,
        } => {
            cmd::cmd_run(&config, args, resume_from.as_deref(), run_id.as_deref()).await?;
        }
        Commands::Dispatch { args } => cmd::cmd_dispatch(&config, args)?,
        Commands::Worker { run_id } => cmd::cmd_worker(&config, run_id).await?,
        Commands::Status { run_id, json } => cmd::cmd_status(&config, run_id, *json)?,
        Commands::List { json } => cmd::cmd_list(&config, *json)?,
        Commands::Config { command } => cmd::cmd_config(&config, command.clone())?,
    }

    Ok(())
}
