//! Configuration management for the evreplay controller

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Connection to the device-side service
    #[serde(default)]
    pub transport: TransportConfig,

    /// Replay preloading and pacing
    #[serde(default)]
    pub replay: ReplayConfig,

    /// Operator history panel
    #[serde(default)]
    pub history: HistoryConfig,

    /// Path to config file (not serialized)
    #[serde(skip)]
    config_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Host the device service is forwarded to
    #[serde(default = "default_host")]
    pub host: String,

    /// Peer port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Delay between round trips (ms)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Upper bound for a single request/response exchange (ms)
    #[serde(default = "default_io_timeout")]
    pub io_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayConfig {
    /// Minimum number of events in a preloaded chunk
    #[serde(default = "default_minimum_preload_size")]
    pub minimum_preload_size: u32,

    /// Minimum time span covered by a preloaded chunk (us)
    #[serde(default = "default_minimum_preload_interval_us")]
    pub minimum_preload_interval_us: i64,

    /// Longest sleep the device may take between replayed events (ms, 0 = unlimited)
    #[serde(default)]
    pub maximum_sleep_ms: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Maximum number of lines kept in the history panel
    #[serde(default = "default_history_text_limit")]
    pub text_limit: usize,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    33001
}

fn default_poll_interval() -> u64 {
    500
}

fn default_io_timeout() -> u64 {
    5000
}

fn default_minimum_preload_size() -> u32 {
    5000
}

fn default_minimum_preload_interval_us() -> i64 {
    5_000_000
}

fn default_history_text_limit() -> usize {
    10000
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            poll_interval_ms: default_poll_interval(),
            io_timeout_ms: default_io_timeout(),
        }
    }
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            minimum_preload_size: default_minimum_preload_size(),
            minimum_preload_interval_us: default_minimum_preload_interval_us(),
            maximum_sleep_ms: 0,
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            text_limit: default_history_text_limit(),
        }
    }
}

impl TransportConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

impl Config {
    /// Load configuration from default location or create default
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            // Create default config
            let config = Config {
                config_path: Some(config_path),
                ..Config::default()
            };
            config.save()?;
            Ok(config)
        }
    }

    /// Load configuration from an explicit file
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let mut config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        config.config_path = Some(path.to_path_buf());
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let config_path = self.config_path()?;

        // Ensure parent directory exists
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(&config_path, contents)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;

        Ok(())
    }

    /// Get the config file path
    pub fn config_path(&self) -> Result<PathBuf> {
        match &self.config_path {
            Some(path) => Ok(path.clone()),
            None => Self::default_config_path(),
        }
    }

    /// Get default config path
    fn default_config_path() -> Result<PathBuf> {
        let proj_dirs = directories::ProjectDirs::from("dev", "evreplay", "controller")
            .context("Failed to determine config directory")?;

        Ok(proj_dirs.config_dir().join("config.toml"))
    }
}
