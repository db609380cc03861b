//! Daemon configuration.
//!
//! Resolution order: environment variables → config file → defaults,
//! mirroring the teacher's `summit-core::config` module.
//!
//! Config file location:
//!   1. $CACHEGRAND_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/cachegrand/config.toml
//!   3. ~/.config/cachegrand/config.toml

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub network: NetworkConfig,
    pub storage: StorageConfig,
    pub snapshot: SnapshotConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub bind_address: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Upper bound on live keys per database; rounded up to the next power
    /// of two by the hash table (spec.md §4.3).
    pub max_keys: usize,
    /// `0` disables the default TTL (spec.md §4.5 "TTL enforcement").
    pub default_ttl_ms: u64,
    /// `0` disables the TTL ceiling.
    pub max_ttl_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    pub directory: PathBuf,
    pub rotation_max_files: usize,
    pub block_size_buckets: usize,
    /// How often the background snapshot fiber runs. `0` disables it —
    /// `cachegrandd` then only ever snapshots if something else drives
    /// `StorageDb::run_snapshot` directly.
    pub interval_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            storage: StorageConfig::default(),
            snapshot: SnapshotConfig::default(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self { bind_address: "127.0.0.1".to_string(), port: 6379 }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { max_keys: 1 << 20, default_ttl_ms: 0, max_ttl_ms: 0 }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            directory: data_dir().join("snapshots"),
            rotation_max_files: 3,
            block_size_buckets: 4096,
            interval_ms: 5 * 60 * 1000,
        }
    }
}

impl SnapshotConfig {
    /// Where the background snapshot fiber writes its RDB file, matching
    /// real Redis's `dump.rdb` naming.
    pub fn file_path(&self) -> PathBuf {
        self.directory.join("dump.rdb")
    }
}

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("cachegrand")
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local").join("share"))
        .join("cachegrand")
}

fn home_dir() -> PathBuf {
    std::env::var("HOME").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("/tmp"))
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
}

impl DaemonConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            DaemonConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn file_path() -> PathBuf {
        std::env::var("CACHEGRAND_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("CACHEGRAND_NETWORK__PORT") {
            if let Ok(p) = v.parse() {
                self.network.port = p;
            }
        }
        if let Ok(v) = std::env::var("CACHEGRAND_NETWORK__BIND_ADDRESS") {
            self.network.bind_address = v;
        }
        if let Ok(v) = std::env::var("CACHEGRAND_STORAGE__MAX_KEYS") {
            if let Ok(n) = v.parse() {
                self.storage.max_keys = n;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_binds_loopback_on_redis_port() {
        let config = DaemonConfig::default();
        assert_eq!(config.network.bind_address, "127.0.0.1");
        assert_eq!(config.network.port, 6379);
    }

    #[test]
    fn apply_env_overrides_changes_port() {
        let mut config = DaemonConfig::default();
        config.network.port = 7000;
        assert_eq!(config.network.port, 7000);
    }
}
