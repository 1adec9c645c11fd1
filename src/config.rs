//! Engine configuration, stored as TOML.
//!
//! Every field has a default, so a config file only needs the sections it
//! changes:
//!
//! ```toml
//! [storage]
//! backend = "embedded"
//! path = "/var/lib/infragraph"
//!
//! [monitor]
//! interval_secs = 600
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::monitor::SchedulerConfig;
use crate::store::{DurableStore, GraphStorage, MemStore, SqlStore, StoreResult};
use crate::sync::SyncOptions;
use crate::temporal::RetentionPolicy;

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Which backend holds the graph.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StorageConfig {
    #[default]
    Memory,
    /// Embedded redb file under `path`.
    Embedded { path: PathBuf },
    /// Networked SQL (`mysql://...`) or local SQLite (`sqlite://...`).
    Sql {
        url: String,
        #[serde(default = "default_max_connections")]
        max_connections: u32,
    },
}

fn default_max_connections() -> u32 {
    8
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub fail_fast: bool,
    #[serde(default = "default_page_limit")]
    pub page_limit: usize,
}

fn default_batch_size() -> usize {
    500
}
fn default_concurrency() -> usize {
    4
}
fn default_page_limit() -> usize {
    1000
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            concurrency: default_concurrency(),
            fail_fast: false,
            page_limit: default_page_limit(),
        }
    }
}

impl SyncConfig {
    /// Baseline per-cycle options; the caller sets the tenant.
    pub fn options(&self) -> SyncOptions {
        SyncOptions {
            batch_size: self.batch_size,
            concurrency: self.concurrency,
            fail_fast: self.fail_fast,
            page_limit: self.page_limit,
            ..SyncOptions::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum cached query results; 0 disables the cache.
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
    /// Entry lifetime; absent means entries live until evicted or invalidated.
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

fn default_cache_capacity() -> usize {
    1024
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
            ttl_secs: None,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default)]
    pub max_snapshots: Option<usize>,
    #[serde(default)]
    pub max_age_days: Option<u64>,
}

impl RetentionConfig {
    pub fn policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            max_snapshots: self.max_snapshots,
            max_age_ms: self.max_age_days.map(|d| d.saturating_mul(24 * 60 * 60 * 1000)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default)]
    pub snapshot_every_cycle: bool,
}

fn default_interval_secs() -> u64 {
    300
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            snapshot_every_cycle: false,
        }
    }
}

impl MonitorConfig {
    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            interval: Duration::from_secs(self.interval_secs),
            snapshot_every_cycle: self.snapshot_every_cycle,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
}

impl EngineConfig {
    /// In-memory storage with default settings.
    pub fn memory() -> Self {
        Self::default()
    }

    pub fn embedded(path: impl Into<PathBuf>) -> Self {
        Self {
            storage: StorageConfig::Embedded { path: path.into() },
            ..Self::default()
        }
    }

    /// Reject settings no engine can run with.
    pub fn validate(&self) -> ConfigResult<()> {
        let invalid = |message: &str| {
            Err(ConfigError::Invalid {
                message: message.to_string(),
            })
        };
        if self.sync.batch_size == 0 {
            return invalid("sync.batch_size must be at least 1");
        }
        if self.sync.concurrency == 0 {
            return invalid("sync.concurrency must be at least 1");
        }
        if self.sync.page_limit == 0 {
            return invalid("sync.page_limit must be at least 1");
        }
        if self.monitor.interval_secs == 0 {
            return invalid("monitor.interval_secs must be at least 1");
        }
        if self.retention.max_snapshots == Some(0) {
            return invalid("retention.max_snapshots must be at least 1 when set");
        }
        if let StorageConfig::Sql { max_connections: 0, .. } = self.storage {
            return invalid("storage.max_connections must be at least 1");
        }
        Ok(())
    }

    /// Load from a TOML file.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Save to a TOML file, creating parent directories.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(self).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.display().to_string(),
                source: e,
            })?;
        }
        std::fs::write(path, content).map_err(|e| ConfigError::Write {
            path: path.display().to_string(),
            source: e,
        })
    }
}

/// Build and initialize the configured backend.
pub async fn open_storage(config: &StorageConfig) -> StoreResult<Arc<dyn GraphStorage>> {
    let storage: Arc<dyn GraphStorage> = match config {
        StorageConfig::Memory => Arc::new(MemStore::new()),
        StorageConfig::Embedded { path } => Arc::new(DurableStore::open(path)?),
        StorageConfig::Sql { url, max_connections } => Arc::new(SqlStore::connect(url, *max_connections).await?),
    };
    storage.initialize().await?;
    tracing::info!(backend = ?config, "storage opened");
    Ok(storage)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.storage, StorageConfig::Memory);
        assert_eq!(config.sync.batch_size, 500);
        assert_eq!(config.monitor.scheduler().interval, Duration::from_secs(300));
    }

    #[test]
    fn partial_sections_fill_defaults() {
        let config: EngineConfig = toml::from_str(
            r#"
            [storage]
            backend = "sql"
            url = "sqlite::memory:"

            [retention]
            max_age_days = 30
            "#,
        )
        .unwrap();
        assert_eq!(
            config.storage,
            StorageConfig::Sql {
                url: "sqlite::memory:".into(),
                max_connections: 8
            }
        );
        assert_eq!(config.retention.policy().max_age_ms, Some(30 * 24 * 60 * 60 * 1000));
        assert_eq!(config.cache.capacity, 1024);
    }

    #[test]
    fn config_roundtrip_toml() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("infragraph.toml");

        let config = EngineConfig {
            cache: CacheConfig {
                capacity: 64,
                ttl_secs: Some(30),
            },
            ..EngineConfig::embedded(tmp.path().join("data"))
        };
        config.save(&path).unwrap();
        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.cache.ttl(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn validation_rejects_zero_concurrency() {
        let mut config = EngineConfig::default();
        config.sync.concurrency = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn missing_file_is_read_error() {
        let err = EngineConfig::load(Path::new("/nonexistent/infragraph.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[tokio::test]
    async fn opens_memory_backend() {
        let storage = open_storage(&StorageConfig::Memory).await.unwrap();
        assert!(storage.list_snapshots().await.unwrap().is_empty());
    }
}
