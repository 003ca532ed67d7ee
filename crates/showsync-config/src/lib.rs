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
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Scheduler and lock timing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// How long an execution lock lives before self-expiring (seconds).
    /// Must be greater than `execution_timeout_secs` so a slow but
    /// legitimate run is not preempted by its own lock expiring.
    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: u64,
    /// Hard wall-clock limit for one task execution (seconds).
    #[serde(default = "default_execution_timeout_secs")]
    pub execution_timeout_secs: u64,
    /// Interval between periodic expired-lock sweeps (seconds).
    /// The startup sweep always runs; set to None to disable the periodic one.
    #[serde(default = "default_sweep_interval_secs")]
    pub lock_sweep_interval_secs: Option<u64>,
}

fn default_lock_timeout_secs() -> u64 {
    300
}

fn default_execution_timeout_secs() -> u64 {
    180
}

fn default_sweep_interval_secs() -> Option<u64> {
    Some(900)
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lock_timeout_secs: default_lock_timeout_secs(),
            execution_timeout_secs: default_execution_timeout_secs(),
            lock_sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

/// External import service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportConfig {
    /// Endpoint of the import service invoked per task run.
    #[serde(default = "default_import_endpoint")]
    pub endpoint: String,
    /// Bearer token for the import service (optional).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

fn default_import_endpoint() -> String {
    "http://127.0.0.1:8150/api/import".to_string()
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            endpoint: default_import_endpoint(),
            auth_token: None,
        }
    }
}

/// Top-level showsync configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShowSyncConfig {
    /// SQLite database path (defaults to ~/.showsync/showsync.db).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_path: Option<PathBuf>,
    /// Scheduler timing.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Import service.
    #[serde(default)]
    pub import: ImportConfig,
    /// Override for this process's lock holder identity.
    /// Normally generated as pid-uuid; set for diagnostics only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub holder_id: Option<String>,
}

impl ShowSyncConfig {
    /// Check cross-field invariants. Fails closed on a lock timeout that
    /// would let a running execution lose its own lock mid-flight.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.lock_timeout_secs <= self.scheduler.execution_timeout_secs {
            return Err(ConfigError::Invalid(format!(
                "lock_timeout_secs ({}) must be greater than execution_timeout_secs ({})",
                self.scheduler.lock_timeout_secs, self.scheduler.execution_timeout_secs
            )));
        }
        Ok(())
    }

    /// Resolve the database path, defaulting under the config directory.
    pub fn database_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.database_path {
            Some(path) => Ok(path.clone()),
            None => Ok(config_dir()?.join("showsync.db")),
        }
    }
}

/// Resolve the showsync config directory (~/.showsync/).
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    dirs::home_dir()
        .map(|h| h.join(".showsync"))
        .ok_or(ConfigError::NoDirFound)
}

/// Resolve the config file path (~/.showsync/config.json5).
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("config.json5"))
}

/// Load configuration from the default path, falling back to defaults.
pub fn load_config() -> Result<ShowSyncConfig, ConfigError> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    let path = config_file_path()?;
    load_config_from(&path)
}

/// Load configuration from a specific path, falling back to defaults if not found.
pub fn load_config_from(path: &Path) -> Result<ShowSyncConfig, ConfigError> {
    if !path.exists() {
        tracing::debug!("Config file not found at {}, using defaults", path.display());
        return Ok(ShowSyncConfig::default());
    }

    let content = std::fs::read_to_string(path)?;
    let config: ShowSyncConfig = json5::from_str(&content)?;
    config.validate()?;
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

/// Save configuration to the default path.
pub fn save_config(config: &ShowSyncConfig) -> Result<(), ConfigError> {
    let dir = ensure_config_dir()?;
    let path = dir.join("config.json5");
    let content = serde_json::to_string_pretty(config)
        .map_err(|e| ConfigError::Io(std::io::Error::other(e)))?;
    std::fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ShowSyncConfig::default();
        assert_eq!(config.scheduler.lock_timeout_secs, 300);
        assert_eq!(config.scheduler.execution_timeout_secs, 180);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_json5_parse() {
        let json5_str = r#"{
            scheduler: {
                lock_timeout_secs: 600,
                execution_timeout_secs: 240,
            },
            import: { endpoint: "http://importer.local/api/import" },
        }"#;
        let config: ShowSyncConfig = json5::from_str(json5_str).unwrap();
        assert_eq!(config.scheduler.lock_timeout_secs, 600);
        assert_eq!(config.import.endpoint, "http://importer.local/api/import");
        assert!(config.holder_id.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_inverted_timeouts() {
        let mut config = ShowSyncConfig::default();
        config.scheduler.lock_timeout_secs = 120;
        config.scheduler.execution_timeout_secs = 180;
        assert!(config.validate().is_err());

        // Equal is also rejected: the lock must outlive the execution
        config.scheduler.lock_timeout_secs = 180;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_database_path_override() {
        let config = ShowSyncConfig {
            database_path: Some(PathBuf::from("/tmp/test.db")),
            ..Default::default()
        };
        assert_eq!(config.database_path().unwrap(), PathBuf::from("/tmp/test.db"));
    }
}
