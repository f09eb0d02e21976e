//! Config command handlers

use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use fieldsync_core::config::{MAX_PROGRESS_INTERVAL_MS, MAX_SHUTDOWN_TIMEOUT_SECS};
use fieldsync_core::Config;

use crate::output::{or_not_set, Output, OutputFormat};

/// Keys accepted by `config set`
const VALID_KEYS: &str = "data_dir, group_key, device_name, device_type, \
                          progress_interval_ms, shutdown_timeout_secs, report_group_errors, log_file";

/// Show current configuration
pub fn show(config_path: Option<&PathBuf>, output: &Output) -> Result<()> {
    let config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;
    // Only the first characters of the group key are ever printed
    let group_key = config.group_key().map(|key| format!("{}…", key.short()));

    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "data_dir": config.data_dir,
                    "group_key": group_key,
                    "device_name": config.device_name,
                    "device_type": config.device_type,
                    "progress_interval_ms": config.progress_interval_ms,
                    "shutdown_timeout_secs": config.shutdown_timeout_secs,
                    "report_group_errors": config.report_group_errors,
                    "presets": config.presets_path(),
                    "log_file": config.log_file
                })
            );
        }
        OutputFormat::Quiet => {
            println!("{}", config.data_dir.display());
        }
        OutputFormat::Human => {
            let effective_path = config_path
                .cloned()
                .unwrap_or_else(Config::config_file_path);
            println!("Configuration:");
            println!("  data_dir:              {}", config.data_dir.display());
            println!("  group_key:             {}", or_not_set(group_key.as_deref()));
            println!("  device_name:           {}", config.device_name);
            println!("  device_type:           {}", config.device_type);
            println!("  progress_interval_ms:  {}", config.progress_interval_ms);
            println!("  shutdown_timeout_secs: {}", config.shutdown_timeout_secs);
            println!("  report_group_errors:   {}", config.report_group_errors);
            println!(
                "  log_file:              {}",
                config
                    .log_file
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "(not set)".to_string())
            );
            println!();
            println!("Presets:     {}", config.presets_path().display());
            println!("Config file: {}", effective_path.display());
        }
    }

    Ok(())
}

/// Set a configuration value
pub fn set(
    key: String,
    value: String,
    config_path: Option<&PathBuf>,
    output: &Output,
) -> Result<()> {
    let mut config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;

    apply(&mut config, &key, &value)?;

    // Save to the CLI-specified path or default
    let save_path = config_path
        .cloned()
        .unwrap_or_else(Config::config_file_path);
    config
        .save_to_path(&save_path)
        .context("Failed to save configuration")?;

    // Never echo the group key back
    let shown = if key == "group_key" && config.group_key.is_some() {
        config
            .group_key()
            .map(|k| format!("{}…", k.short()))
            .unwrap_or_default()
    } else {
        value
    };
    output.success(&format!("Set {} = {}", key, shown));

    Ok(())
}

/// Empty and "none" clear optional settings
fn optional(value: &str) -> Option<String> {
    if value.is_empty() || value == "none" {
        None
    } else {
        Some(value.to_string())
    }
}

fn apply(config: &mut Config, key: &str, value: &str) -> Result<()> {
    match key {
        "data_dir" => {
            config.data_dir = value.into();
        }
        "group_key" => {
            config.group_key = optional(value);
        }
        "device_name" => {
            if value.trim().is_empty() {
                bail!("device_name cannot be empty");
            }
            config.device_name = value.to_string();
        }
        "device_type" => {
            config.device_type = value.parse().map_err(anyhow::Error::msg)?;
        }
        "progress_interval_ms" => {
            let ms: u64 = value
                .parse()
                .context("Invalid value for progress_interval_ms. Use a number of milliseconds.")?;
            if ms > MAX_PROGRESS_INTERVAL_MS {
                bail!("progress_interval_ms cannot exceed {}", MAX_PROGRESS_INTERVAL_MS);
            }
            config.progress_interval_ms = ms;
        }
        "shutdown_timeout_secs" => {
            let secs: u64 = value
                .parse()
                .context("Invalid value for shutdown_timeout_secs. Use a number of seconds.")?;
            if secs > MAX_SHUTDOWN_TIMEOUT_SECS {
                bail!("shutdown_timeout_secs cannot exceed {}", MAX_SHUTDOWN_TIMEOUT_SECS);
            }
            config.shutdown_timeout_secs = secs;
        }
        "report_group_errors" => {
            config.report_group_errors = value
                .parse()
                .context("Invalid value for report_group_errors. Use 'true' or 'false'.")?;
        }
        "log_file" => {
            config.log_file = optional(value).map(PathBuf::from);
        }
        _ => {
            bail!(
                "Unknown configuration key: '{}'\nValid keys: {}",
                key,
                VALID_KEYS
            );
        }
    }
    Ok(())
}
