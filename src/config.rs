//! Config loading: `warden.toml` plus `WARDEN_*` environment overrides.
//!
//! Every field has a default; a missing file is not an error and a broken
//! one degrades to defaults with a warning, so the supervisor always starts.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::endpoint::DEFAULT_SOCKET_PATH;

pub const DEFAULT_CONFIG_PATH: &str = "./warden.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Unix-domain socket the supervisor binds and workers dial.
    pub socket_path: PathBuf,
    /// Default timeout for point calls issued by the CLI.
    pub call_timeout_ms: u64,
    pub memory: MemoryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            call_timeout_ms: 30_000,
            memory: MemoryConfig::default(),
        }
    }
}

impl Config {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Seconds between leak checks.
    pub interval_secs: u64,
    /// Per-process resident limit. `None` disables the kill policy; the
    /// monitor still tracks and reports.
    pub limit_bytes: Option<u64>,
    /// When set, offenders are sampled before being signalled.
    pub sample: Option<SampleConfig>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            limit_bytes: None,
            sample: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SampleConfig {
    pub duration_secs: f64,
    pub timeout_secs: Option<u64>,
}

impl Default for SampleConfig {
    fn default() -> Self {
        Self {
            duration_secs: 1.0,
            timeout_secs: Some(30),
        }
    }
}

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl ConfigError {
    pub fn code(&self) -> &'static str {
        match self {
            ConfigError::Read { .. } => "config_read",
            ConfigError::Parse { .. } => "config_parse",
        }
    }
}

/// Load from `path` (default `./warden.toml`), then apply env overrides.
/// A missing file yields defaults.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or(Path::new(DEFAULT_CONFIG_PATH));
    let mut config = if path.exists() {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?
    } else {
        Config::default()
    };
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Like [`load`], but never fails: a broken file logs a warning and the
/// defaults (still env-overridable) are used.
pub fn load_or_default(path: Option<&Path>) -> Config {
    match load(path) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!("config load failed, using defaults: {e}");
            let mut config = Config::default();
            apply_env_overrides(&mut config);
            config
        }
    }
}

pub fn apply_env_overrides(config: &mut Config) {
    apply_overrides(config, |name| std::env::var(name).ok());
}

fn apply_overrides(config: &mut Config, get: impl Fn(&str) -> Option<String>) {
    if let Some(raw) = get("WARDEN_SOCKET") {
        let trimmed = raw.trim();
        if !trimmed.is_empty() {
            config.socket_path = PathBuf::from(trimmed);
        }
    }

    if let Some(raw) = get("WARDEN_CALL_TIMEOUT_MS") {
        match raw.trim().parse::<u64>() {
            Ok(value) => config.call_timeout_ms = value,
            Err(e) => tracing::warn!("invalid WARDEN_CALL_TIMEOUT_MS, ignoring: {e}"),
        }
    }

    if let Some(raw) = get("WARDEN_MEMORY_INTERVAL_SECS") {
        match raw.trim().parse::<u64>() {
            Ok(value) => config.memory.interval_secs = value,
            Err(e) => tracing::warn!("invalid WARDEN_MEMORY_INTERVAL_SECS, ignoring: {e}"),
        }
    }

    if let Some(raw) = get("WARDEN_MEMORY_LIMIT_BYTES") {
        match raw.trim().parse::<u64>() {
            Ok(value) => config.memory.limit_bytes = Some(value),
            Err(e) => tracing::warn!("invalid WARDEN_MEMORY_LIMIT_BYTES, ignoring: {e}"),
        }
    }
}
