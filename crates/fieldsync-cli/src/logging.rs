//! Logging setup
//!
//! stdout belongs to the `serve` protocol, so logs go to stderr or to the
//! configured log file.

use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Environment variable holding the log level
const LOG_ENV: &str = "FIELDSYNC_LOG";

const DEFAULT_LEVEL: &str = "warn";

/// Pick the log level: command line, then FIELDSYNC_LOG, then warn
pub fn level(flag: Option<String>) -> String {
    resolve_level(flag, std::env::var(LOG_ENV).ok())
}

fn resolve_level(flag: Option<String>, env: Option<String>) -> String {
    flag.or(env)
        .filter(|level| !level.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_LEVEL.to_string())
}

/// Initialize the tracing subscriber
pub fn init(level: &str, log_file: Option<&Path>) -> Result<()> {
    let env_filter = EnvFilter::new(format!(
        "fieldsync_core={},fieldsync_cli={}",
        level, level
    ));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false);

    // Ignore the error if a subscriber is already installed
    match log_file {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("Could not create log file {:?}", path))?;
            let _ = builder.with_ansi(false).with_writer(file).try_init();
            info!("Logging initialized to {:?}", path);
        }
        None => {
            let _ = builder.with_writer(std::io::stderr).try_init();
        }
    }

    Ok(())
}
