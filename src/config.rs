//! Configuration for message-cluster-store

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default storage directory
pub fn default_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("message-cluster-store")
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the database and config file
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// SQLite database file name inside `storage_dir`
    #[serde(default = "default_database_file")]
    pub database_file: String,

    /// Maximum pooled connections
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// How long to wait for a pooled connection
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,

    /// SQLite busy_timeout applied to every connection
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Extra attempts for a write that hit lock contention
    #[serde(default = "default_max_write_retries")]
    pub max_write_retries: u32,

    /// Base delay between write attempts (multiplied by attempt number)
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Ledger rows fetched per page by the history iterator
    #[serde(default = "default_history_page_size")]
    pub history_page_size: i64,

    /// Page size used when a ranked query does not specify one
    #[serde(default = "default_rank_limit")]
    pub default_rank_limit: i64,

    /// Upper bound on a ranked query page
    #[serde(default = "default_max_rank_limit")]
    pub max_rank_limit: i64,

    /// Clusters per transaction during counter reconciliation
    #[serde(default = "default_reconcile_batch_size")]
    pub reconcile_batch_size: i64,

    /// Buffered events per subscriber on the event bus
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Actor credited with the initial `unclassified` ledger entry
    #[serde(default)]
    pub system_actor_id: i64,
}

fn default_database_file() -> String {
    "moderation.db".to_string()
}

fn default_pool_size() -> u32 {
    8
}

fn default_connection_timeout_ms() -> u64 {
    30_000
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_max_write_retries() -> u32 {
    5
}

fn default_retry_backoff_ms() -> u64 {
    25
}

fn default_history_page_size() -> i64 {
    50
}

fn default_rank_limit() -> i64 {
    50
}

fn default_max_rank_limit() -> i64 {
    500
}

fn default_reconcile_batch_size() -> i64 {
    500
}

fn default_event_capacity() -> usize {
    1024
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            database_file: default_database_file(),
            pool_size: default_pool_size(),
            connection_timeout_ms: default_connection_timeout_ms(),
            busy_timeout_ms: default_busy_timeout_ms(),
            max_write_retries: default_max_write_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            history_page_size: default_history_page_size(),
            default_rank_limit: default_rank_limit(),
            max_rank_limit: default_max_rank_limit(),
            reconcile_batch_size: default_reconcile_batch_size(),
            event_capacity: default_event_capacity(),
            system_actor_id: 0,
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), std::io::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    /// Get database file path
    pub fn database_path(&self) -> PathBuf {
        self.storage_dir.join(&self.database_file)
    }

    /// Get config file path
    pub fn config_path(&self) -> PathBuf {
        self.storage_dir.join("config.toml")
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    /// Reject settings the store cannot run with.
    pub fn validate(&self) -> Result<(), crate::StorageError> {
        if self.pool_size == 0 {
            return Err(crate::StorageError::Config("pool_size must be at least 1".into()));
        }
        if self.history_page_size < 1 {
            return Err(crate::StorageError::Config("history_page_size must be at least 1".into()));
        }
        if self.max_rank_limit < 1 || self.default_rank_limit < 1 {
            return Err(crate::StorageError::Config("rank limits must be at least 1".into()));
        }
        if self.default_rank_limit > self.max_rank_limit {
            return Err(crate::StorageError::Config(
                "default_rank_limit exceeds max_rank_limit".into(),
            ));
        }
        if self.reconcile_batch_size < 1 {
            return Err(crate::StorageError::Config(
                "reconcile_batch_size must be at least 1".into(),
            ));
        }
        if self.event_capacity < 1 || self.event_capacity > usize::MAX / 2 {
            return Err(crate::StorageError::Config(format!(
                "event_capacity must be between 1 and {}",
                usize::MAX / 2
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str("pool_size = 2\nmax_write_retries = 9\n").unwrap();
        assert_eq!(config.pool_size, 2);
        assert_eq!(config.max_write_retries, 9);
        assert_eq!(config.database_file, "moderation.db");
        assert_eq!(config.busy_timeout_ms, 5_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.storage_dir = dir.path().to_path_buf();
        config.history_page_size = 7;
        config.save(config.config_path()).unwrap();

        let loaded = Config::load(config.config_path()).unwrap();
        assert_eq!(loaded.history_page_size, 7);
        assert_eq!(loaded.database_path(), dir.path().join("moderation.db"));
    }

    #[test]
    fn test_validate_rejects_bad_limits() {
        let mut config = Config::default();
        config.default_rank_limit = 1_000;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.pool_size = 0;
        assert!(config.validate().is_err());

        let config: Config = toml::from_str("event_capacity = 0\n").unwrap();
        assert!(matches!(config.validate(), Err(crate::StorageError::Config(_))));
    }

    #[test]
    fn test_open_rejects_zero_event_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            storage_dir: dir.path().to_path_buf(),
            event_capacity: 0,
            ..Default::default()
        };
        assert!(matches!(
            crate::Services::open(&config),
            Err(crate::StorageError::Config(_))
        ));
    }
}
