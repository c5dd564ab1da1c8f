//! Configuration for the sync engine.
//!
//! Loaded from TOML. Every field has a default so an absent or partial file
//! still produces a usable configuration.

use crate::error::{Result, SyncError};
use crate::retry::RetryPolicy;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "OFFLINE_SYNC_CONFIG";

const CONFIG_FILE_NAME: &str = "config.toml";
const DATABASE_FILE_NAME: &str = "sync.duckdb";

/// Top-level engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    /// Persistent record store settings
    pub store: StoreConfig,
    /// Backoff applied to failed mutation replays
    pub retry: RetryConfig,
    /// Interval for the optional periodic replay task (disabled when unset)
    pub replay_interval_secs: Option<u64>,
    /// Network state assumed until the platform reports otherwise
    pub start_online: bool,
    /// Default tracing filter directive
    pub log_filter: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            retry: RetryConfig::default(),
            replay_interval_secs: None,
            start_online: true,
            log_filter: "info".to_string(),
        }
    }
}

/// Which record store backend to open
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    Memory,
    Duckdb,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Database file; defaults to the platform data directory
    pub path: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Duckdb,
            path: None,
        }
    }
}

impl StoreConfig {
    /// Resolve the database file for the DuckDB backend.
    pub fn database_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.path {
            return Ok(path.clone());
        }
        project_dirs()
            .map(|dirs| dirs.data_dir().join(DATABASE_FILE_NAME))
            .ok_or_else(|| SyncError::Config("unable to resolve a data directory".to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 5 * 60 * 1_000,
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.initial_delay_ms),
            Duration::from_millis(self.max_delay_ms),
            self.multiplier,
        )
    }
}

impl SyncConfig {
    /// Load configuration from `OFFLINE_SYNC_CONFIG`, the default config
    /// location, or built-in defaults, in that order.
    pub fn load() -> Result<Self> {
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            return Self::load_from_path(Path::new(&path));
        }

        match Self::default_config_path() {
            Some(path) if path.exists() => Self::load_from_path(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Load configuration from a specific TOML file
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            SyncError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&contents)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: SyncConfig = toml::from_str(contents)
            .map_err(|e| SyncError::Config(format!("invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.retry.multiplier.is_finite() || self.retry.multiplier < 1.0 {
            return Err(SyncError::Config(format!(
                "retry.multiplier must be >= 1.0, got {}",
                self.retry.multiplier
            )));
        }
        if self.retry.max_delay_ms < self.retry.initial_delay_ms {
            return Err(SyncError::Config(format!(
                "retry.max_delay_ms ({}) is smaller than retry.initial_delay_ms ({})",
                self.retry.max_delay_ms, self.retry.initial_delay_ms
            )));
        }
        if self.replay_interval_secs == Some(0) {
            return Err(SyncError::Config(
                "replay_interval_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn replay_interval(&self) -> Option<Duration> {
        self.replay_interval_secs.map(Duration::from_secs)
    }

    pub fn default_config_path() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
    }
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "offline-sync")
}
