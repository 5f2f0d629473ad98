use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use todoflow::config::TodoflowConfig;
use todoflow::logging;

mod cmd;

#[derive(Parser)]
#[command(name = "todoflow")]
#[command(version, about = "Decompose a goal into steps and drive them to completion")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Iteration budget per workflow. Overrides todoflow.toml and TODOFLOW_MAX_ITERATIONS.
    #[arg(long, global = true)]
    pub max_iterations: Option<u32>,

    /// Reasoning model name. Overrides todoflow.toml and TODOFLOW_MODEL.
    #[arg(long, global = true)]
    pub model: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Plan a goal and run it until it finishes (Ctrl-C pauses it)
    Run {
        goal: String,

        /// User identity for the one-workflow-per-user gate
        #[arg(long)]
        user: Option<String>,
    },
    /// Dispatch action text outside any workflow, e.g. `[启动工作流:<goal>]`
    Exec {
        text: String,

        #[arg(long)]
        user: Option<String>,
    },
    /// List or show persisted debug logs
    Logs {
        /// Log file to show (name inside the debug log directory, or a path)
        #[arg(long)]
        show: Option<PathBuf>,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate todoflow.toml
    Validate,
    /// Write a default todoflow.toml
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    let config =
        TodoflowConfig::new(project_dir)?.with_cli_args(cli.max_iterations, cli.model.clone());

    let runs_workflows = matches!(cli.command, Commands::Run { .. } | Commands::Exec { .. });
    if runs_workflows {
        config.ensure_directories()?;
    }
    let log_dir = config.log_dir();
    let _guard = logging::init_tracing(
        runs_workflows.then_some(log_dir.as_path()),
        cli.log_json,
        cli.verbose,
    );

    match &cli.command {
        Commands::Run { goal, user } => {
            cmd::cmd_run(&config, goal, user.as_deref(), cli.verbose).await?;
        }
        Commands::Exec { text, user } => {
            cmd::cmd_exec(&config, text, user.as_deref(), cli.verbose).await?;
        }
        Commands::Logs { show } => cmd::cmd_logs(&config, show.as_deref())?,
        Commands::Config { command } => cmd::cmd_config(&config, command.clone())?,
    }

    Ok(())
}
