//! FieldSync CLI
//!
//! Command-line interface for FieldSync - replication session orchestration.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use fieldsync_core::config::MAX_SHUTDOWN_TIMEOUT_SECS;
use fieldsync_core::{Config, Simulation};

mod commands;
mod logging;
mod output;

use commands::serve::ServeOptions;
use output::{Output, OutputFormat};

#[derive(Parser)]
#[command(name = "fieldsync")]
#[command(about = "FieldSync - Peer-to-peer replication for field data")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Config file (default: ~/.config/fieldsync/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level (overrides FIELDSYNC_LOG)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestrator, reading JSON commands from stdin
    Serve {
        /// Progress events per simulated replication
        #[arg(long, default_value_t = 20)]
        steps: u64,
        /// Milliseconds between simulated progress events
        #[arg(long, default_value_t = 10)]
        step_delay_ms: u64,
        /// Join the swarm after listening
        #[arg(long)]
        join: bool,
        /// Group key (overrides the config file)
        #[arg(long)]
        group_key: Option<String>,
        /// Name announced to peers (overrides the config file)
        #[arg(long)]
        device_name: Option<String>,
        /// Seconds to wait for running replications on shutdown
        #[arg(long, value_parser = clap::value_parser!(u64).range(..=MAX_SHUTDOWN_TIMEOUT_SECS))]
        shutdown_timeout: Option<u64>,
        /// Write logs to this file instead of stderr
        #[arg(long)]
        log_file: Option<PathBuf>,
    },
    /// Show or set configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Configuration key (data_dir, group_key, device_name, device_type, ...)
        key: String,
        /// Configuration value
        value: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));

    match cli.command {
        Commands::Config { command } => handle_config_command(command, cli.config.as_ref(), &output),
        Commands::Serve {
            steps,
            step_delay_ms,
            join,
            group_key,
            device_name,
            shutdown_timeout,
            log_file,
        } => {
            let mut config = Config::load_with_cli_override(cli.config.as_ref())
                .context("Failed to load configuration")?;
            if group_key.is_some() {
                config.group_key = group_key;
            }
            if let Some(name) = device_name {
                config.device_name = name;
            }
            if let Some(secs) = shutdown_timeout {
                config.shutdown_timeout_secs = secs;
            }
            if log_file.is_some() {
                config.log_file = log_file;
            }

            logging::init(&logging::level(cli.log_level), config.log_file.as_deref())?;

            let options = ServeOptions {
                simulation: Simulation {
                    steps,
                    step_delay: Duration::from_millis(step_delay_ms),
                },
                join,
            };
            commands::serve::run(&config, options).await
        }
    }
}

fn handle_config_command(
    command: Option<ConfigCommands>,
    config_path: Option<&PathBuf>,
    output: &Output,
) -> Result<()> {
    match command {
        Some(ConfigCommands::Show) | None => commands::config::show(config_path, output),
        Some(ConfigCommands::Set { key, value }) => {
            commands::config::set(key, value, config_path, output)
        }
    }
}
