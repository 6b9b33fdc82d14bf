//! Stepwise CLI - operator tooling for Stepwise agents and workflows.

mod commands;
mod ui;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use stepwise_core::Config;
use stepwise_core::config::LogFormat;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use commands::check::{CheckArgs, CheckTarget};
use commands::checkpoints::CheckpointsAction;
use commands::config::ConfigAction;

#[derive(Parser)]
#[command(name = "stepwise")]
#[command(about = "Stepwise - inspect agent configuration, restrictions, and checkpoints")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (defaults to ~/.stepwise/stepwise.json)
    #[arg(long, global = true, env = "STEPWISE_CONFIG_PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Configuration get/set
    Config {
        #[command(subcommand)]
        action: Option<ConfigCommands>,
    },

    /// Dry-run the security gate
    Check {
        #[command(subcommand)]
        target: CheckCommands,

        /// Agent whose restriction applies
        #[arg(long, global = true, default_value = "default")]
        agent: String,
    },

    /// Inspect persisted checkpoints
    Checkpoints {
        #[command(subcommand)]
        action: CheckpointsCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Get a configuration value
    Get {
        /// Configuration key (e.g., agents.default.model)
        key: String,
    },

    /// Set a configuration value
    Set {
        /// Configuration key (e.g., agents.default.restriction.approval)
        key: String,

        /// Value to set
        value: String,
    },

    /// Show full configuration
    Show,

    /// Validate configuration
    Validate,

    /// Write a default configuration
    Init,
}

#[derive(Subcommand)]
enum CheckCommands {
    /// Check a shell command against the allowlist
    Command {
        /// Command line to check
        command: String,
    },

    /// Check a path against the base directory
    Path {
        /// Path to check
        path: PathBuf,
    },
}

#[derive(Subcommand)]
enum CheckpointsCommands {
    /// List runs
    List,

    /// Show a run's checkpoint
    Show {
        /// Run ID
        run_id: String,

        /// Show every checkpoint, not just the latest
        #[arg(long)]
        history: bool,
    },
}

fn init_logging(verbose: bool, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));

    let (pretty, json) = match format {
        LogFormat::Pretty => (Some(fmt::layer().with_target(false)), None),
        LogFormat::Json => (None, Some(fmt::layer().json())),
    };

    tracing_subscriber::registry()
        .with(pretty)
        .with(json)
        .with(filter)
        .init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);

    // Config commands must work on files that do not parse yet.
    let loaded = if config_path.exists() {
        Config::load(&config_path)
    } else {
        Ok(Config::default())
    };

    let settings = loaded.as_ref().map(|c| c.settings.clone()).unwrap_or_default();
    init_logging(cli.verbose || settings.debug, settings.log_format);
    match &loaded {
        Ok(_) => tracing::debug!(path = %config_path.display(), "Using config"),
        Err(e) => tracing::debug!(path = %config_path.display(), error = %e, "Config did not load"),
    }

    match cli.command {
        Commands::Config { action } => {
            let action = match action {
                Some(ConfigCommands::Get { key }) => ConfigAction::Get(key),
                Some(ConfigCommands::Set { key, value }) => ConfigAction::Set { key, value },
                Some(ConfigCommands::Validate) => ConfigAction::Validate,
                Some(ConfigCommands::Init) => ConfigAction::Init,
                Some(ConfigCommands::Show) | None => ConfigAction::Show,
            };
            commands::run_config(action, &config_path)?;
        }

        Commands::Check { target, agent } => {
            let config = loaded.with_context(|| format!("Invalid config: {}", config_path.display()))?;
            let args = CheckArgs {
                target: match target {
                    CheckCommands::Command { command } => CheckTarget::Command(command),
                    CheckCommands::Path { path } => CheckTarget::Path(path),
                },
                agent,
                cwd: std::env::current_dir()?,
            };
            commands::run_check(&args, &config)?;
        }

        Commands::Checkpoints { action } => {
            let config = loaded.with_context(|| format!("Invalid config: {}", config_path.display()))?;
            let action = match action {
                CheckpointsCommands::List => CheckpointsAction::List,
                CheckpointsCommands::Show { run_id, history } => {
                    CheckpointsAction::Show { run_id, history }
                }
            };
            commands::run_checkpoints(&action, &config.checkpoints_dir())?;
        }
    }

    Ok(())
}
