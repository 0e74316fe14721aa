use std::fs;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Name used for the platform config and data directories
pub const APP_NAME: &str = "thais";

#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    #[error("Config file not found")]
    NotFound,
    #[error("Failed to parse config: {0}")]
    ParseError(String),
    #[error("IO error reading config: {0}")]
    IoError(String),
    #[error("Could not determine the config directory")]
    NoConfigDir,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Largest inbound frame accepted before the connection is dropped
    #[serde(default = "default_max_packet_len")]
    pub max_packet_len: usize,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    7172
}

fn default_max_packet_len() -> usize {
    u16::MAX as usize
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_packet_len: default_max_packet_len(),
        }
    }
}

impl ServerConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Interval of the recurring world heartbeat. 0 disables it.
    #[serde(default = "default_world_tick_ms")]
    pub world_tick_ms: u64,
    /// How often scheduler stats are logged. 0 disables the report.
    #[serde(default = "default_stats_interval_ms")]
    pub stats_interval_ms: u64,
}

fn default_world_tick_ms() -> u64 {
    50
}

fn default_stats_interval_ms() -> u64 {
    60_000
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            world_tick_ms: default_world_tick_ms(),
            stats_interval_ms: default_stats_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Also write logs to a file in the data directory
    #[serde(default)]
    pub file: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThaisConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ThaisConfig {
    pub fn config_path() -> Result<PathBuf, ConfigLoadError> {
        let dirs = ProjectDirs::from("", "", APP_NAME).ok_or(ConfigLoadError::NoConfigDir)?;
        Ok(dirs.config_dir().join("config.toml"))
    }

    /// Load from the platform config directory
    pub fn load() -> Result<Self, ConfigLoadError> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigLoadError> {
        if !path.exists() {
            return Err(ConfigLoadError::NotFound);
        }

        let content =
            fs::read_to_string(path).map_err(|e| ConfigLoadError::IoError(e.to_string()))?;
        let config =
            toml::from_str(&content).map_err(|e| ConfigLoadError::ParseError(e.to_string()))?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<PathBuf> {
        let path = Self::config_path()?;
        self.save_to(&path)?;
        Ok(path)
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        info!("Saved config to {}", path.display());
        Ok(())
    }
}
