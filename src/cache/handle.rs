//! Ownership of the on-disk caches of one cache root.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};

use super::{CacheConfig, CacheStore};
use crate::error::{StorageError, SweepResult};
use crate::grid::ResultGrid;
use crate::worker::Record;

/// Directory of the whole-sweep cache.
pub const SWEEP_CACHE_DIR: &str = "benchmark_inputs";

/// Directory of the over-time history cache.
pub const HISTORY_DIR: &str = "history";

/// Directory of a sweep's per-cell cache, under the sweep's own directory.
pub const SAMPLE_CACHE_DIR: &str = "sample_cache";

/// The caches under one root directory.
///
/// The sweep and history stores are opened with the handle. Per-sweep
/// sample stores are opened on demand and shared by every live
/// [`CacheSession`] for the same sweep name; the store is closed when the
/// last session drops. Several handles, in this or other processes, may
/// share one root.
#[derive(Debug)]
pub struct CacheHandle {
    root: PathBuf,
    config: CacheConfig,
    sweeps: CacheStore<ResultGrid>,
    history: CacheStore<ResultGrid>,
    samples: Mutex<HashMap<String, Weak<CacheStore<Record>>>>,
}

impl CacheHandle {
    /// Opens (creating if needed) the caches under `root`.
    pub fn open(root: impl AsRef<Path>, config: CacheConfig) -> SweepResult<Self> {
        let root = root.as_ref().to_path_buf();
        let config = config.validate()?;
        let sweeps = CacheStore::open(&root.join(SWEEP_CACHE_DIR), &config)?;
        let history = CacheStore::open(&root.join(HISTORY_DIR), &config)?;
        tracing::debug!(root = %root.display(), "Opened cache root");
        Ok(Self {
            root,
            config,
            sweeps,
            history,
            samples: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub const fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Whole-sweep results keyed by the full specification hash.
    pub const fn sweep_cache(&self) -> &CacheStore<ResultGrid> {
        &self.sweeps
    }

    /// Over-time accumulations keyed by the full specification hash.
    pub const fn history(&self) -> &CacheStore<ResultGrid> {
        &self.history
    }

    /// Sample store of `sweep_name`, opening it if no session holds it.
    pub fn sample_cache(&self, sweep_name: &str) -> Result<Arc<CacheStore<Record>>, StorageError> {
        let mut samples = self
            .samples
            .lock()
            .map_err(|_| StorageError::Poisoned { context: "cache.samples" })?;
        if let Some(store) = samples.get(sweep_name).and_then(Weak::upgrade) {
            return Ok(store);
        }
        samples.retain(|_, weak| weak.strong_count() > 0);

        let dir = self.root.join(dir_name(sweep_name)).join(SAMPLE_CACHE_DIR);
        let store = Arc::new(CacheStore::open(&dir, &self.config)?);
        samples.insert(sweep_name.to_string(), Arc::downgrade(&store));
        Ok(store)
    }

    /// Starts a session for one run of `sweep_name`.
    pub fn session(&self, sweep_name: &str) -> Result<CacheSession, StorageError> {
        Ok(CacheSession {
            sweep_name: sweep_name.to_string(),
            samples: self.sample_cache(sweep_name)?,
        })
    }
}

/// Caches held for the duration of one run. Dropping the session releases
/// its hold on the sample store.
#[derive(Debug, Clone)]
pub struct CacheSession {
    sweep_name: String,
    samples: Arc<CacheStore<Record>>,
}

impl CacheSession {
    pub fn sweep_name(&self) -> &str {
        &self.sweep_name
    }

    pub const fn sample_cache(&self) -> &Arc<CacheStore<Record>> {
        &self.samples
    }
}

/// File-system-safe directory name for a sweep.
fn dir_name(sweep_name: &str) -> String {
    let name: String = sweep_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    match name.trim_start_matches('.') {
        "" => "_".to_string(),
        trimmed => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_layout() {
        let dir = tempdir().unwrap();
        let handle = CacheHandle::open(dir.path(), CacheConfig::default()).unwrap();
        let _session = handle.session("my bench").unwrap();
        assert!(dir.path().join(SWEEP_CACHE_DIR).is_dir());
        assert!(dir.path().join(HISTORY_DIR).is_dir());
        assert!(dir.path().join("my_bench").join(SAMPLE_CACHE_DIR).is_dir());
    }

    #[test]
    fn test_sessions_share_sample_store() {
        let dir = tempdir().unwrap();
        let handle = CacheHandle::open(dir.path(), CacheConfig::default()).unwrap();
        let a = handle.session("bench").unwrap();
        let b = handle.session("bench").unwrap();
        assert!(Arc::ptr_eq(a.sample_cache(), b.sample_cache()));
        drop(a);
        drop(b);
        assert!(handle.session("bench").is_ok());
    }

    #[test]
    fn test_two_handles_on_same_root_write_distinct_keys() {
        let dir = tempdir().unwrap();
        let config = CacheConfig {
            sync_on_write: false,
            ..CacheConfig::default()
        };
        let first = CacheHandle::open(dir.path(), config.clone()).unwrap();
        let second = CacheHandle::open(dir.path(), config.clone()).unwrap();

        let a = first.session("bench").unwrap();
        let b = second.session("bench").unwrap();
        a.sample_cache()
            .put("cell_a", "", Record::new().with("z", 1.0))
            .unwrap();
        b.sample_cache()
            .put("cell_b", "", Record::new().with("z", 2.0))
            .unwrap();
        assert!(a.sample_cache().get("cell_b").unwrap().is_some());
        drop((a, b, first, second));

        let reopened = CacheHandle::open(dir.path(), config).unwrap();
        let samples = reopened.sample_cache("bench").unwrap();
        assert_eq!(samples.len().unwrap(), 2);
        assert_eq!(samples.get("cell_a").unwrap().and_then(|r| r.float("z")), Some(1.0));
        assert_eq!(samples.get("cell_b").unwrap().and_then(|r| r.float("z")), Some(2.0));
    }

    #[test]
    fn test_dir_name_sanitizes() {
        assert_eq!(dir_name("a/b c"), "a_b_c");
        assert_eq!(dir_name("..hidden"), "hidden");
        assert_eq!(dir_name(""), "_");
    }
}
