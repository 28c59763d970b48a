//! Persistent caches.
//!
//! Three kinds of store live under one cache root:
//!
//! ```text
//! cachedir/
//! ├── benchmark_inputs/         whole-sweep results, keyed by full sweep hash
//! ├── history/                  over-time accumulations, same key
//! └── <sweep-name>/sample_cache per-cell worker results, keyed by cell input + tag
//! ```
//!
//! Each store directory holds a `.lock` file, an append-only `cache.wal`
//! and an optional `cache.snapshot`. The lock is taken around each write,
//! so several processes may share a cache root:
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │               CacheStore<V>              │
//! │  ┌──────────────┐   ┌─────────────────┐  │
//! │  │  CacheLog    │   │  cache.snapshot │  │
//! │  │ (append-only)│   │  (temp+rename)  │  │
//! │  └──────┬───────┘   └────────┬────────┘  │
//! │         └─────────┬──────────┘           │
//! │                   ↓                      │
//! │         ┌───────────────────┐            │
//! │         │  DirLock (flock)  │            │
//! │         └───────────────────┘            │
//! └──────────────────────────────────────────┘
//! ```

mod codec;
mod file_lock;
mod handle;
mod log;
mod store;

pub use file_lock::{DirLock, DirLockGuard};
pub use handle::{CacheHandle, CacheSession, HISTORY_DIR, SAMPLE_CACHE_DIR, SWEEP_CACHE_DIR};
pub use log::{Appended, LogOp, LogRecord, LOG_HEADER_LEN};
pub use store::{CacheEntry, CacheStore, CompactionStats, LOG_FILE, SNAPSHOT_FILE};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Tuning of the persistent stores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Whether to fsync the log after every append (slower but durable
    /// across power loss).
    pub sync_on_write: bool,
    /// Log size in bytes beyond which the store compacts into a snapshot.
    pub max_wal_size: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            sync_on_write: true,
            max_wal_size: 64 * 1024 * 1024,
        }
    }
}

impl CacheConfig {
    /// Smallest accepted `max_wal_size`; anything lower compacts on nearly
    /// every write.
    pub const MIN_WAL_SIZE: u64 = 4 * 1024;

    /// Checks the configured bounds.
    pub fn validate(self) -> Result<Self, ConfigError> {
        if self.max_wal_size < Self::MIN_WAL_SIZE {
            return Err(ConfigError::InvalidOption {
                option: "max_wal_size".to_string(),
                reason: format!(
                    "must be at least {} bytes (got {})",
                    Self::MIN_WAL_SIZE,
                    self.max_wal_size
                ),
            });
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(CacheConfig::default().validate().is_ok());
    }

    #[test]
    fn test_tiny_wal_rejected() {
        let config = CacheConfig {
            max_wal_size: 16,
            ..CacheConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidOption { .. })
        ));
    }
}
