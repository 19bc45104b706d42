//! CLI configuration.
//!
//! Configuration is resolved in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via BINLOG_CONFIG or --config)
//! 3. Environment variables
//! 4. Command-line flags

use binlog_store::{BinlogConfig, LeaseConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage configuration.
    pub storage: StorageConfig,
}

impl Config {
    /// Loads configuration from `path` (or BINLOG_CONFIG), then applies
    /// environment variable overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match std::env::var("BINLOG_CONFIG") {
                Ok(path) => Self::from_file(path)?,
                Err(_) => Self::default(),
            },
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))
    }

    /// Applies overrides read through `lookup` (environment variables in
    /// production).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        self.storage.apply_overrides(&lookup);
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the segment files.
    pub data_dir: PathBuf,
    /// Segment file base name.
    pub base_name: String,
    /// Segment capacity in megabytes.
    pub capacity_mb: u64,
    /// Fsync every append.
    pub sync_on_append: bool,
    /// Per-segment file handle limits.
    pub lease: LeaseConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            base_name: "binlog".to_string(),
            capacity_mb: 1024,
            sync_on_append: false,
            lease: LeaseConfig::default(),
        }
    }
}

impl StorageConfig {
    fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup("BINLOG_DATA") {
            self.data_dir = PathBuf::from(dir);
        }

        if let Some(name) = lookup("BINLOG_NAME") {
            self.base_name = name;
        }

        if let Some(size) = lookup("BINLOG_CAPACITY_MB") {
            if let Ok(mb) = size.parse() {
                self.capacity_mb = mb;
            }
        }

        if let Some(sync) = lookup("BINLOG_SYNC") {
            self.sync_on_append = sync == "1" || sync.to_lowercase() == "true";
        }

        if let Some(max) = lookup("BINLOG_MAX_LEASES") {
            if let Ok(n) = max.parse() {
                self.lease.max_leases = n;
            }
        }

        if let Some(max) = lookup("BINLOG_MAX_IDLE") {
            if let Ok(n) = max.parse() {
                self.lease.max_idle = n;
            }
        }
    }

    /// Returns the segment capacity in bytes, saturating at `u64::MAX`.
    pub fn capacity(&self) -> u64 {
        self.capacity_mb.saturating_mul(1024 * 1024)
    }

    /// Builds the store configuration.
    pub fn binlog_config(&self) -> BinlogConfig {
        BinlogConfig::new(&self.data_dir, &self.base_name)
            .with_capacity(self.capacity())
            .with_sync_on_append(self.sync_on_append)
            .with_lease(self.lease)
    }
}

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {1}", .0.display())]
    Io(PathBuf, std::io::Error),

    #[error("failed to parse config file '{}': {1}", .0.display())]
    Parse(PathBuf, String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.storage.capacity(), 1024 * 1024 * 1024);
        assert_eq!(config.storage.base_name, "binlog");
        assert!(!config.storage.sync_on_append);
        assert_eq!(config.storage.lease, LeaseConfig::default());
    }

    #[test]
    fn test_yaml_partial_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("binlog.yaml");
        std::fs::write(
            &path,
            "storage:\n  data_dir: /var/lib/binlog\n  capacity_mb: 16\n  lease:\n    max_idle: 1\n",
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.storage.data_dir, PathBuf::from("/var/lib/binlog"));
        assert_eq!(config.storage.capacity(), 16 * 1024 * 1024);
        assert_eq!(config.storage.base_name, "binlog");
        assert_eq!(config.storage.lease.max_idle, 1);
        assert_eq!(config.storage.lease.max_leases, 64);
    }

    #[test]
    fn test_missing_file() {
        let result = Config::from_file("/nonexistent/binlog.yaml");
        assert!(matches!(result, Err(ConfigError::Io(_, _))));
    }

    #[test]
    fn test_invalid_yaml() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("bad.yaml");
        std::fs::write(&path, "storage: [unclosed").unwrap();
        assert!(matches!(
            Config::from_file(&path),
            Err(ConfigError::Parse(_, _))
        ));
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("BINLOG_DATA", "/tmp/logs"),
            ("BINLOG_NAME", "events"),
            ("BINLOG_CAPACITY_MB", "8"),
            ("BINLOG_SYNC", "true"),
            ("BINLOG_MAX_LEASES", "not-a-number"),
            ("BINLOG_MAX_IDLE", "2"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));

        let storage = &config.storage;
        assert_eq!(storage.data_dir, PathBuf::from("/tmp/logs"));
        assert_eq!(storage.base_name, "events");
        assert_eq!(storage.capacity(), 8 * 1024 * 1024);
        assert!(storage.sync_on_append);
        assert_eq!(storage.lease.max_leases, 64);
        assert_eq!(storage.lease.max_idle, 2);

        let binlog = storage.binlog_config();
        assert_eq!(binlog.base_name, "events");
        assert_eq!(binlog.capacity, 8 * 1024 * 1024);
        assert!(binlog.sync_on_append);
    }

    #[test]
    fn test_huge_capacity_saturates() {
        let mut config = Config::default();
        config.apply_overrides(|key| {
            (key == "BINLOG_CAPACITY_MB").then(|| u64::MAX.to_string())
        });
        assert_eq!(config.storage.capacity_mb, u64::MAX);
        assert_eq!(config.storage.capacity(), u64::MAX);
        assert_eq!(config.storage.binlog_config().capacity, u64::MAX);
    }

    #[test]
    fn test_yaml_roundtrip() {
        let config = Config::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.storage.data_dir, config.storage.data_dir);
        assert_eq!(parsed.storage.lease, config.storage.lease);
    }
}
