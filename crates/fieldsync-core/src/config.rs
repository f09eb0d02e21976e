//! Application configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/fieldsync/config.toml)
//! 3. Environment variables (FIELDSYNC_* prefix)
//!
//! Environment variables take precedence over config file values.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::peer::{DeviceType, GroupKey};

/// Environment variable prefix
const ENV_PREFIX: &str = "FIELDSYNC";

/// Used when the hostname can't be determined
const FALLBACK_DEVICE_NAME: &str = "FieldSync Desktop";

/// Longest shutdown drain accepted (one day)
pub const MAX_SHUTDOWN_TIMEOUT_SECS: u64 = 24 * 60 * 60;

/// Longest peer-update spacing accepted (one minute)
pub const MAX_PROGRESS_INTERVAL_MS: u64 = 60 * 1000;

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory for local data (presets, exports, logs)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Shared project key used to join the swarm and to replicate
    #[serde(default)]
    pub group_key: Option<String>,

    /// Name announced to other peers
    #[serde(default = "default_device_name")]
    pub device_name: String,

    /// Device type declared when we start a replication
    #[serde(default = "default_device_type")]
    pub device_type: DeviceType,

    /// Minimum spacing between peer-list updates while syncing
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,

    /// How long shutdown waits for running replications
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    /// Send a notification when joining or leaving the group fails
    #[serde(default)]
    pub report_group_errors: bool,

    /// Log file for `serve` (stderr when unset)
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            group_key: None,
            device_name: default_device_name(),
            device_type: default_device_type(),
            progress_interval_ms: default_progress_interval_ms(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            report_group_errors: false,
            log_file: None,
        }
    }
}

impl Config {
    /// Load configuration from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (FIELDSYNC_DATA_DIR, FIELDSYNC_GROUP_KEY, ...)
    /// 2. Config file (~/.config/fieldsync/config.toml or FIELDSYNC_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load configuration, preferring a path given on the command line
    pub fn load_with_cli_override(config_path: Option<&PathBuf>) -> Result<Self> {
        match config_path {
            Some(path) => Self::load_from_path(path),
            None => Self::load(),
        }
    }

    /// Load configuration from a specific path
    ///
    /// Environment variables are still applied as overrides.
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &PathBuf) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        config.ensure_data_dir()?;
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(toml_content).context("Failed to parse config TOML")?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var(format!("{}_DATA_DIR", ENV_PREFIX)) {
            self.data_dir = PathBuf::from(val);
        }

        // Empty string clears the key
        if let Ok(val) = std::env::var(format!("{}_GROUP_KEY", ENV_PREFIX)) {
            self.group_key = if val.is_empty() { None } else { Some(val) };
        }

        if let Ok(val) = std::env::var(format!("{}_DEVICE_NAME", ENV_PREFIX)) {
            if !val.is_empty() {
                self.device_name = val;
            }
        }

        if let Ok(val) = std::env::var(format!("{}_SHUTDOWN_TIMEOUT_SECS", ENV_PREFIX)) {
            match val.parse() {
                Ok(secs) => self.shutdown_timeout_secs = secs,
                Err(_) => warn!(
                    "Ignoring {}_SHUTDOWN_TIMEOUT_SECS={:?}: not a number",
                    ENV_PREFIX, val
                ),
            }
        }

        if let Ok(val) = std::env::var(format!("{}_REPORT_GROUP_ERRORS", ENV_PREFIX)) {
            self.report_group_errors = val.eq_ignore_ascii_case("true") || val == "1";
        }
    }

    /// Ensure data directory exists
    fn ensure_data_dir(&self) -> Result<()> {
        if !self.data_dir.exists() {
            std::fs::create_dir_all(&self.data_dir)
                .with_context(|| format!("Failed to create data directory: {:?}", self.data_dir))?;
        }
        Ok(())
    }

    /// Save configuration to the default file
    pub fn save(&self) -> Result<()> {
        self.save_to_path(&Self::config_file_path())
    }

    /// Save configuration to a specific file
    pub fn save_to_path(&self, config_path: &PathBuf) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(config_path, content)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;
        Ok(())
    }

    /// Get the config file path
    ///
    /// Can be overridden with FIELDSYNC_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Ok(path) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("fieldsync")
            .join("config.toml")
    }

    /// Preset definitions attached to exports
    pub fn presets_path(&self) -> PathBuf {
        self.data_dir.join("presets.json")
    }

    pub fn group_key(&self) -> Option<GroupKey> {
        self.group_key.clone().map(GroupKey::new)
    }

    /// Peer-update spacing, capped at [`MAX_PROGRESS_INTERVAL_MS`]
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms.min(MAX_PROGRESS_INTERVAL_MS))
    }

    /// Shutdown drain deadline, capped at [`MAX_SHUTDOWN_TIMEOUT_SECS`]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs.min(MAX_SHUTDOWN_TIMEOUT_SECS))
    }
}

/// Get the default data directory
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fieldsync")
}

/// Hostname without its domain, or a generic name
fn default_device_name() -> String {
    hostname::get()
        .ok()
        .and_then(|hostname| computer_name(&hostname.to_string_lossy()))
        .unwrap_or_else(|| FALLBACK_DEVICE_NAME.to_string())
}

/// Strip the domain part hostnames often carry
pub fn computer_name(hostname: &str) -> Option<String> {
    let name = hostname.trim().split('.').next().unwrap_or("").trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

fn default_device_type() -> DeviceType {
    // Mobile clients only accept replication from peers announcing as mobile
    DeviceType::Mobile
}

fn default_progress_interval_ms() -> u64 {
    50
}

fn default_shutdown_timeout_secs() -> u64 {
    5 * 60
}
