//! Configuration management
//!
//! TOML-backed configuration with per-field defaults: backing-store
//! connectivity, sub-query execution limits, and monitoring settings.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::Error;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Backing-store connectivity
    #[serde(default)]
    pub store: StoreSettings,

    /// Sub-query execution limits
    #[serde(default)]
    pub executor: ExecutorSettings,

    /// Monitoring and observability
    #[serde(default)]
    pub monitoring: MonitoringSettings,
}

/// Backing-store connectivity
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreSettings {
    /// Store host
    #[serde(default = "default_host")]
    pub host: String,

    /// Store port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Database name
    #[serde(default = "default_database")]
    pub database: String,
}

/// Sub-query execution limits
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutorSettings {
    /// Maximum sub-queries in flight per query
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    /// Per-sub-query time budget in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl ExecutorSettings {
    /// The time budget as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Monitoring configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitoringSettings {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable structured logging
    #[serde(default = "default_true")]
    pub structured_logging: bool,
}

// Default value functions
fn default_host() -> String {
    "localhost".to_string()
}
fn default_port() -> u16 {
    28015
}
fn default_database() -> String {
    "analytics".to_string()
}
fn default_max_parallel() -> usize {
    num_cpus::get().min(8)
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            database: default_database(),
        }
    }
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for MonitoringSettings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            structured_logging: default_true(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path)?;
        toml::from_str(&contents).map_err(|e| Error::Configuration(e.to_string()))
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        let contents =
            toml::to_string_pretty(self).map_err(|e| Error::Configuration(e.to_string()))?;
        std::fs::write(path, contents)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.store.host, "localhost");
        assert_eq!(config.store.port, 28015);
        assert_eq!(config.store.database, "analytics");
        assert!(config.executor.max_parallel >= 1);
        assert_eq!(config.executor.timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [store]
            host = "db.internal"

            [executor]
            timeout_secs = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.store.host, "db.internal");
        assert_eq!(config.store.port, 28015);
        assert_eq!(config.executor.timeout_secs, 5);
        assert_eq!(config.monitoring.log_level, "info");
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("docfold.toml");

        let mut config = Config::default();
        config.store.database = "metrics".into();
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.store.database, "metrics");
    }
}
