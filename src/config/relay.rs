//! Relay configuration
//!
//! Loads `relay.toml`. Every key is optional; a missing file yields defaults.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default configuration file name
pub const CONFIG_FILE: &str = "relay.toml";

/// Catalog file name inside the state directory
pub const CATALOG_FILE: &str = "catalog.json";

/// Errors that can occur during config operations
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// How the supervised program is hosted
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackendSettings {
    /// tmux executable
    pub tmux_bin: String,
    /// Prefix for backend session names
    pub session_prefix: String,
    /// Supervised interactive program
    pub program: String,
    /// Arguments for a fresh start
    pub args: Vec<String>,
    /// Arguments appended when a lost session is restarted
    pub resume_args: Vec<String>,
    /// Geometry used until an observer reports its own
    pub default_cols: u16,
    pub default_rows: u16,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            tmux_bin: "tmux".to_string(),
            session_prefix: "relay-".to_string(),
            program: "claude".to_string(),
            args: Vec::new(),
            resume_args: vec!["--continue".to_string()],
            default_cols: 80,
            default_rows: 24,
        }
    }
}

impl BackendSettings {
    /// Full command line for the supervised program
    pub fn program_command(&self, resume: bool) -> Vec<String> {
        let mut command = vec![self.program.clone()];
        command.extend(self.args.iter().cloned());
        if resume {
            command.extend(self.resume_args.iter().cloned());
        }
        command
    }
}

/// Top-level relay configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    pub bind: String,
    pub port: u16,
    /// Directory holding the session catalog
    pub state_dir: PathBuf,
    /// Scrollback capacity per session, in bytes
    pub scrollback_bytes: usize,
    pub idle_threshold_secs: u64,
    pub sweep_interval_secs: u64,
    /// Settle delay between detached create and attach
    pub spawn_settle_ms: u64,
    /// Delay before forwarding a queued initial input after spawn
    pub initial_input_delay_ms: u64,
    pub list_cache_ttl_secs: u64,
    /// Per-observer queue depth before the observer is dropped
    pub observer_queue_frames: usize,
    pub preview_max_chars: usize,
    pub backend: BackendSettings,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 7681,
            state_dir: PathBuf::from(".session-relay"),
            scrollback_bytes: 100 * 1024,
            idle_threshold_secs: 30,
            sweep_interval_secs: 5,
            spawn_settle_ms: 300,
            initial_input_delay_ms: 1500,
            list_cache_ttl_secs: 5,
            observer_queue_frames: 1024,
            preview_max_chars: 120,
            backend: BackendSettings::default(),
        }
    }
}

impl RelayConfig {
    /// Load configuration from `path`, falling back to defaults if it does not exist
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: RelayConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero = [
            ("scrollback_bytes", self.scrollback_bytes as u64),
            ("idle_threshold_secs", self.idle_threshold_secs),
            ("sweep_interval_secs", self.sweep_interval_secs),
            ("observer_queue_frames", self.observer_queue_frames as u64),
            ("backend.default_cols", u64::from(self.backend.default_cols)),
            ("backend.default_rows", u64::from(self.backend.default_rows)),
        ];
        for (key, value) in non_zero {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be non-zero", key)));
            }
        }
        if self.backend.program.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "backend.program cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.state_dir.join(CATALOG_FILE)
    }

    pub fn idle_threshold(&self) -> Duration {
        Duration::from_secs(self.idle_threshold_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn spawn_settle(&self) -> Duration {
        Duration::from_millis(self.spawn_settle_ms)
    }

    pub fn initial_input_delay(&self) -> Duration {
        Duration::from_millis(self.initial_input_delay_ms)
    }

    pub fn list_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.list_cache_ttl_secs)
    }
}
