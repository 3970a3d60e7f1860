use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON5 parse error: {0}")]
    Json5(#[from] json5::Error),
    #[error("Config directory not found")]
    NoDirFound,
}

/// Control endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,
    /// Bearer token for authentication (optional).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

fn default_port() -> u16 {
    4520
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            auth_token: None,
        }
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Tick resolution in seconds. Fires are detected at this granularity.
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
}

fn default_tick_secs() -> u64 {
    30
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_tick_secs(),
        }
    }
}

/// Sub-agent executor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Shell command the runtime hands each task's message to. The command
    /// receives the message on stdin and replies on stdout; an empty reply
    /// or the literal NOTHING is treated as a no-op completion.
    #[serde(default = "default_executor_command")]
    pub command: String,
    /// Default per-task deadline in seconds.
    #[serde(default = "default_deadline_secs")]
    pub default_deadline_secs: u64,
}

fn default_executor_command() -> String {
    "vigil-agent".to_string()
}

fn default_deadline_secs() -> u64 {
    300
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            command: default_executor_command(),
            default_deadline_secs: default_deadline_secs(),
        }
    }
}

/// Top-level vigil configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VigilConfig {
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    /// Database path override; defaults to ~/.vigil/vigil.db.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_path: Option<PathBuf>,
}

/// Resolve the vigil config directory (~/.vigil/).
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    dirs::home_dir()
        .map(|h| h.join(".vigil"))
        .ok_or(ConfigError::NoDirFound)
}

/// Resolve the config file path (~/.vigil/config.json5).
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("config.json5"))
}

/// Load configuration from the default path, falling back to defaults.
pub fn load_config() -> Result<VigilConfig, ConfigError> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    let path = config_file_path()?;
    load_config_from(&path)
}

/// Load configuration from a specific path, falling back to defaults if not found.
pub fn load_config_from(path: &Path) -> Result<VigilConfig, ConfigError> {
    if !path.exists() {
        tracing::debug!("Config file not found at {}, using defaults", path.display());
        return Ok(VigilConfig::default());
    }

    let content = std::fs::read_to_string(path)?;
    let config: VigilConfig = json5::from_str(&content)?;
    Ok(config)
}

/// Ensure the config directory exists.
pub fn ensure_config_dir() -> Result<PathBuf, ConfigError> {
    let dir = config_dir()?;
    if !dir.exists() {
        std::fs::create_dir_all(&dir)?;
    }
    Ok(dir)
}

/// Resolve the database path from config, defaulting under the config dir.
pub fn resolve_db_path(config: &VigilConfig) -> Result<PathBuf, ConfigError> {
    match &config.db_path {
        Some(p) => Ok(p.clone()),
        None => Ok(ensure_config_dir()?.join("vigil.db")),
    }
}
