//! MemSync configuration management

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main MemSync configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MemSyncConfig {
    /// Vector store backend configuration
    pub store: StoreConfig,

    /// Connection pool configuration
    pub pool: PoolConfig,

    /// Retry configuration
    pub retry: RetryConfig,

    /// Circuit breaker configuration
    pub breaker: BreakerConfig,

    /// Chunk repository configuration
    pub repository: RepositoryConfig,

    /// Conflict resolver configuration
    pub resolver: ResolverConfig,

    /// Sync manager configuration
    pub sync: SyncConfig,

    /// Peer transport configuration
    pub server: ServerConfig,

    /// Conflict record persistence
    pub conflicts: ConflictsConfig,
}

impl MemSyncConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that cannot produce a working engine
    pub fn validate(&self) -> Result<()> {
        if self.pool.max_size == 0 {
            return Err(Error::Config("pool.max_size must be positive".to_string()));
        }
        if self.pool.min_size > self.pool.max_size {
            return Err(Error::Config(format!(
                "pool.min_size ({}) exceeds pool.max_size ({})",
                self.pool.min_size, self.pool.max_size
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Config("retry.max_attempts must be at least 1".to_string()));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(Error::Config(
                "breaker.failure_threshold must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.resolver.auto_merge_threshold) {
            return Err(Error::Config(format!(
                "resolver.auto_merge_threshold must be within [0, 1], got {}",
                self.resolver.auto_merge_threshold
            )));
        }
        if self.resolver.max_attempts == 0 {
            return Err(Error::Config("resolver.max_attempts must be at least 1".to_string()));
        }
        if self.repository.embedding_dim == 0 {
            return Err(Error::Config("repository.embedding_dim must be positive".to_string()));
        }
        if self.sync.batch_workers == 0 {
            return Err(Error::Config("sync.batch_workers must be positive".to_string()));
        }
        Ok(())
    }
}

/// Vector store backend type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// In-process vector store
    #[default]
    Memory,

    /// Qdrant over its REST API
    Qdrant,
}

/// Vector store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Backend type
    pub backend: StoreBackend,

    /// Base URL of the vector database (Qdrant only)
    pub url: String,

    /// Collection holding the chunks
    pub collection: String,

    /// Optional API key sent as `api-key`
    pub api_key: Option<String>,

    /// Deadline for a single store call in milliseconds
    pub call_timeout_ms: u64,
}

impl StoreConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            url: "http://localhost:6333".to_string(),
            collection: "memory_chunks".to_string(),
            api_key: None,
            call_timeout_ms: 10_000,
        }
    }
}

/// Connection pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Connections created eagerly and kept through health checks
    pub min_size: usize,

    /// Hard cap on open connections
    pub max_size: usize,

    /// How long `acquire` waits before failing with `PoolExhausted`
    pub acquire_timeout_ms: u64,

    /// Connections older than this are retired on checkout (0 = never)
    pub max_lifetime_secs: u64,

    /// Idle connection health check period (0 = disabled)
    pub health_check_interval_secs: u64,
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn max_lifetime(&self) -> Option<Duration> {
        (self.max_lifetime_secs > 0).then(|| Duration::from_secs(self.max_lifetime_secs))
    }

    pub fn health_check_interval(&self) -> Option<Duration> {
        (self.health_check_interval_secs > 0)
            .then(|| Duration::from_secs(self.health_check_interval_secs))
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 2,
            max_size: 10,
            acquire_timeout_ms: 5_000,
            max_lifetime_secs: 2 * 60 * 60,
            health_check_interval_secs: 60,
        }
    }
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first call
    pub max_attempts: u32,

    /// Delay before the first retry in milliseconds
    pub base_delay_ms: u64,

    /// Upper bound on a single delay in milliseconds
    pub max_delay_ms: u64,

    /// Randomize each delay within `[0, delay]`
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 100,
            max_delay_ms: 30_000,
            jitter: true,
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Failures within the window that open the circuit
    pub failure_threshold: u32,

    /// Sliding window for counting failures in milliseconds
    pub window_ms: u64,

    /// Time the circuit stays open before allowing a trial call
    pub cooldown_ms: u64,
}

impl BreakerConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window_ms: 60_000,
            cooldown_ms: 30_000,
        }
    }
}

/// Chunk repository configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Expected embedding dimensionality
    pub embedding_dim: usize,

    /// Superseded versions kept per chunk for three-way merges
    pub history_depth: usize,

    /// Largest accepted `top_k` for searches
    pub max_top_k: usize,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            embedding_dim: 384,
            history_depth: 16,
            max_top_k: 100,
        }
    }
}

/// Conflict resolver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Similarity at or above which overlapping edits resolve last-writer-wins
    pub auto_merge_threshold: f32,

    /// Resolution attempts against fresh state before escalating to manual
    pub max_attempts: u32,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            auto_merge_threshold: 0.85,
            max_attempts: 3,
        }
    }
}

/// Sync manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Concurrent chunk groups processed by a batch
    pub batch_workers: usize,

    /// Undelivered changes retained per peer
    pub peer_backlog_capacity: usize,

    /// Seconds a disconnected peer's state is kept (0 = forever)
    pub peer_idle_ttl_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_workers: 8,
            peer_backlog_capacity: 10_000,
            peer_idle_ttl_secs: 7 * 24 * 3600,
        }
    }
}

impl SyncConfig {
    pub fn peer_idle_ttl(&self) -> Option<Duration> {
        (self.peer_idle_ttl_secs > 0).then(|| Duration::from_secs(self.peer_idle_ttl_secs))
    }
}

/// Peer transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Longest accepted frame in bytes
    pub max_frame_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 18791,
            max_frame_bytes: 4 * 1024 * 1024,
        }
    }
}

/// Conflict record persistence
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictsConfig {
    /// Persist records as JSON files
    pub persist: bool,

    /// Directory for persisted records
    pub dir: PathBuf,
}

impl Default for ConflictsConfig {
    fn default() -> Self {
        Self {
            persist: true,
            dir: dirs_next::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("memsync")
                .join("conflicts"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MemSyncConfig::default();
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.pool.max_size, 10);
        assert_eq!(config.resolver.auto_merge_threshold, 0.85);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: MemSyncConfig = toml::from_str(
            r#"
            [store]
            backend = "qdrant"
            url = "http://qdrant:6333"

            [retry]
            max_attempts = 7
            "#,
        )
        .unwrap();
        assert_eq!(config.store.backend, StoreBackend::Qdrant);
        assert_eq!(config.store.collection, "memory_chunks");
        assert_eq!(config.retry.max_attempts, 7);
        assert_eq!(config.retry.base_delay_ms, 100);
        assert_eq!(config.breaker.failure_threshold, 5);
    }

    #[test]
    fn test_validate_rejects_min_above_max() {
        let mut config = MemSyncConfig::default();
        config.pool.min_size = 20;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("min_size"));
    }

    #[test]
    fn test_validate_rejects_threshold_out_of_range() {
        let mut config = MemSyncConfig::default();
        config.resolver.auto_merge_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_durations() {
        let mut pool = PoolConfig::default();
        assert_eq!(pool.acquire_timeout(), Duration::from_secs(5));
        pool.max_lifetime_secs = 0;
        assert!(pool.max_lifetime().is_none());
        pool.health_check_interval_secs = 0;
        assert!(pool.health_check_interval().is_none());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memsync.toml");
        std::fs::write(&path, "[server]\nport = 9000\n").unwrap();
        let config = MemSyncConfig::load(&path).unwrap();
        assert_eq!(config.server.port, 9000);

        std::fs::write(&path, "[pool]\nmax_size = 0\n").unwrap();
        assert!(MemSyncConfig::load(&path).is_err());
    }
}
