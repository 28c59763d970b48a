//! File-backed key-value store.
//!
//! A `CacheStore` keeps every entry in an in-memory index and persists
//! mutations to an append-only [`CacheLog`]. When the log grows past the
//! configured size it is folded into a snapshot file (written to a temp
//! file and renamed into place) and truncated. Opening a store loads the
//! snapshot and replays the log on top of it.
//!
//! Writes are serialised through a writer mutex within the process and the
//! directory's file lock across processes. Every write first applies the
//! records other handles appended since its last visit, so handles sharing
//! a directory converge on the same contents.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::codec;
use super::file_lock::DirLock;
use super::log::{CacheLog, LogIter, LogOp, LOG_HEADER_LEN};
use super::CacheConfig;
use crate::error::StorageError;

/// Name of the log file inside a store directory.
pub const LOG_FILE: &str = "cache.wal";

/// Name of the snapshot file inside a store directory.
pub const SNAPSHOT_FILE: &str = "cache.snapshot";

/// One stored value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<V> {
    pub key: String,
    pub tag: String,
    pub value: V,
    pub stored_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
struct Snapshot<V> {
    created_at: DateTime<Utc>,
    entries: Vec<CacheEntry<V>>,
}

/// Outcome of a compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionStats {
    pub entries: usize,
    pub log_bytes_before: u64,
    pub log_bytes_after: u64,
}

struct Index<V> {
    entries: HashMap<String, CacheEntry<V>>,
    by_tag: HashMap<String, HashSet<String>>,
}

impl<V> Index<V> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            by_tag: HashMap::new(),
        }
    }

    fn insert(&mut self, entry: CacheEntry<V>) {
        self.unlink(&entry.key);
        self.by_tag
            .entry(entry.tag.clone())
            .or_default()
            .insert(entry.key.clone());
        self.entries.insert(entry.key.clone(), entry);
    }

    fn unlink(&mut self, key: &str) -> Option<CacheEntry<V>> {
        let old = self.entries.remove(key)?;
        if let Some(keys) = self.by_tag.get_mut(&old.tag) {
            keys.remove(key);
            if keys.is_empty() {
                self.by_tag.remove(&old.tag);
            }
        }
        Some(old)
    }

    fn clear_tag(&mut self, tag: &str) -> usize {
        let Some(keys) = self.by_tag.remove(tag) else {
            return 0;
        };
        for key in &keys {
            self.entries.remove(key);
        }
        keys.len()
    }

    fn apply(&mut self, op: LogOp<V>) {
        match op {
            LogOp::Put {
                key,
                tag,
                value,
                stored_at,
            } => self.insert(CacheEntry {
                key,
                tag,
                value,
                stored_at,
            }),
            LogOp::Remove { key } => {
                self.unlink(&key);
            }
            LogOp::ClearTag { tag } => {
                self.clear_tag(&tag);
            }
        }
    }
}

/// Position reached in the shared log.
#[derive(Debug, Clone, Copy)]
struct LogCursor {
    generation: u64,
    offset: u64,
}

/// Persistent key-value store over one shared directory.
pub struct CacheStore<V> {
    dir: PathBuf,
    lock: DirLock,
    log: CacheLog,
    index: RwLock<Index<V>>,
    writer: Mutex<LogCursor>,
    config: CacheConfig,
}

impl<V> std::fmt::Debug for CacheStore<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("dir", &self.dir)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<V> CacheStore<V>
where
    V: Serialize + DeserializeOwned + Clone,
{
    /// Opens or creates the store in `dir`.
    ///
    /// The directory lock is held while the snapshot and log are loaded and
    /// released before returning; other handles on the same directory may
    /// be open at the same time.
    ///
    /// `config` is expected to have passed [`CacheConfig::validate`].
    pub fn open(dir: &Path, config: &CacheConfig) -> Result<Self, StorageError> {
        let config = config.clone();
        fs::create_dir_all(dir)
            .map_err(|e| StorageError::io(format!("create {}", dir.display()), e))?;

        let lock = DirLock::open(dir)?;
        let log_path = dir.join(LOG_FILE);
        let log = {
            let _guard = lock.exclusive()?;
            remove_stale_temp_files(dir);
            CacheLog::open(&log_path, config.sync_on_write)
                .map_err(|e| StorageError::io(format!("open {}", log_path.display()), e))?
        };

        let store = Self {
            dir: dir.to_path_buf(),
            lock,
            log,
            index: RwLock::new(Index::new()),
            writer: Mutex::new(LogCursor {
                generation: 0,
                offset: LOG_HEADER_LEN,
            }),
            config,
        };
        {
            let mut cursor = store.writer()?;
            let _guard = store.lock.exclusive()?;
            store.reload(&mut cursor)?;
        }
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn read_index(&self) -> Result<RwLockReadGuard<'_, Index<V>>, StorageError> {
        self.index
            .read()
            .map_err(|_| StorageError::Poisoned { context: "cache.index" })
    }

    fn write_index(&self) -> Result<RwLockWriteGuard<'_, Index<V>>, StorageError> {
        self.index
            .write()
            .map_err(|_| StorageError::Poisoned { context: "cache.index" })
    }

    fn writer(&self) -> Result<MutexGuard<'_, LogCursor>, StorageError> {
        self.writer
            .lock()
            .map_err(|_| StorageError::Poisoned { context: "cache.writer" })
    }

    fn log_error(&self, e: &std::io::Error) -> StorageError {
        StorageError::Corrupted {
            message: format!("{}: {e}", self.log.path().display()),
        }
    }

    fn load_snapshot(&self, index: &mut Index<V>) -> Result<(), StorageError> {
        let path = self.dir.join(SNAPSHOT_FILE);
        if !path.exists() {
            return Ok(());
        }
        let context = || format!("read {}", path.display());
        let file = File::open(&path).map_err(|e| StorageError::io(context(), e))?;
        let mut reader = BufReader::new(file);
        codec::read_header(&mut reader).map_err(|e| StorageError::Corrupted {
            message: format!("{}: {e}", path.display()),
        })?;
        let snapshot: Snapshot<V> =
            codec::decode(&mut reader).map_err(|e| StorageError::Corrupted {
                message: format!("{}: {e}", path.display()),
            })?;

        for entry in snapshot.entries {
            index.insert(entry);
        }
        tracing::debug!(
            dir = %self.dir.display(),
            entries = index.entries.len(),
            created_at = %snapshot.created_at,
            "Loaded cache snapshot"
        );
        Ok(())
    }

    /// Applies log records from `iter` to `index`, returning how many were
    /// applied and the last sequence seen.
    fn apply_records(&self, iter: &mut LogIter<V>, index: &mut Index<V>) -> (usize, u64) {
        let mut count = 0usize;
        let mut last_sequence = 0;
        for record in iter.by_ref() {
            match record {
                Ok(record) => {
                    last_sequence = record.sequence;
                    index.apply(record.op);
                    count += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        log = %self.log.path().display(),
                        after_sequence = last_sequence,
                        error = %e,
                        "Corrupt cache log record; ignoring the rest of the log"
                    );
                    break;
                }
            }
        }
        (count, last_sequence)
    }

    /// Rebuilds the index from the snapshot and the whole log.
    /// Requires the writer mutex and the directory lock.
    fn reload(&self, cursor: &mut LogCursor) -> Result<(), StorageError> {
        let mut index = Index::new();
        self.load_snapshot(&mut index)?;

        let mut iter = self.log.iter::<V>().map_err(|e| self.log_error(&e))?;
        let (count, last_sequence) = self.apply_records(&mut iter, &mut index);
        *self.write_index()? = index;
        self.log.resume_at(last_sequence)?;
        *cursor = LogCursor {
            generation: iter.generation(),
            offset: iter.valid_end(),
        };

        if count > 0 {
            tracing::debug!(dir = %self.dir.display(), records = count, "Replayed cache log");
        }
        self.compact_if_unclean(&iter, cursor)
    }

    /// Applies records appended by other handles since `cursor`.
    /// Requires the writer mutex and the directory lock.
    fn catch_up(&self, cursor: &mut LogCursor) -> Result<(), StorageError> {
        let mut iter = self
            .log
            .iter_from::<V>(cursor.offset)
            .map_err(|e| self.log_error(&e))?;
        if iter.generation() != cursor.generation {
            tracing::debug!(
                dir = %self.dir.display(),
                from = cursor.generation,
                to = iter.generation(),
                "Cache log compacted by another handle; reloading"
            );
            return self.reload(cursor);
        }

        let (count, last_sequence) = {
            let mut index = self.write_index()?;
            self.apply_records(&mut iter, &mut index)
        };
        if count > 0 {
            self.log.observe(last_sequence)?;
            tracing::trace!(
                dir = %self.dir.display(),
                records = count,
                "Applied log records from other handles"
            );
        }
        cursor.offset = iter.valid_end();
        self.compact_if_unclean(&iter, cursor)
    }

    fn compact_if_unclean(
        &self,
        iter: &LogIter<V>,
        cursor: &mut LogCursor,
    ) -> Result<(), StorageError> {
        if !iter.clean() {
            tracing::warn!(
                log = %self.log.path().display(),
                valid_bytes = iter.valid_end(),
                "Cache log ends in an incomplete record; compacting"
            );
            self.compact_locked(cursor)?;
        }
        Ok(())
    }

    /// Picks up entries written through other handles on the same
    /// directory since the last write or refresh.
    pub fn refresh(&self) -> Result<(), StorageError> {
        let mut cursor = self.writer()?;
        let _guard = self.lock.exclusive()?;
        self.catch_up(&mut cursor)
    }

    /// Value stored under `key`.
    ///
    /// A miss re-reads the log tail before answering, so values written by
    /// other processes are found.
    pub fn get(&self, key: &str) -> Result<Option<V>, StorageError> {
        Ok(self.entry(key)?.map(|e| e.value))
    }

    /// Full entry stored under `key`. Misses refresh like [`Self::get`].
    pub fn entry(&self, key: &str) -> Result<Option<CacheEntry<V>>, StorageError> {
        if let Some(entry) = self.read_index()?.entries.get(key) {
            return Ok(Some(entry.clone()));
        }
        self.refresh()?;
        Ok(self.read_index()?.entries.get(key).cloned())
    }

    pub fn contains(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.read_index()?.entries.contains_key(key))
    }

    pub fn len(&self) -> Result<usize, StorageError> {
        Ok(self.read_index()?.entries.len())
    }

    pub fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }

    /// Keys stored with `tag`.
    pub fn keys_with_tag(&self, tag: &str) -> Result<Vec<String>, StorageError> {
        let index = self.read_index()?;
        let mut keys: Vec<String> = index
            .by_tag
            .get(tag)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        Ok(keys)
    }

    /// Stores `value` under `key`, replacing any previous value.
    ///
    /// The log append completes before the value becomes visible.
    pub fn put(&self, key: &str, tag: &str, value: V) -> Result<(), StorageError> {
        let mut cursor = self.writer()?;
        let _guard = self.lock.exclusive()?;
        self.catch_up(&mut cursor)?;

        let stored_at = Utc::now();
        let appended = self.log.append(LogOp::Put {
            key: key.to_string(),
            tag: tag.to_string(),
            value: &value,
            stored_at,
        })?;
        cursor.offset += appended.len;
        self.write_index()?.insert(CacheEntry {
            key: key.to_string(),
            tag: tag.to_string(),
            value,
            stored_at,
        });
        self.maybe_compact(&mut cursor)
    }

    /// Removes `key`; returns whether it was present.
    pub fn remove(&self, key: &str) -> Result<bool, StorageError> {
        let mut cursor = self.writer()?;
        let _guard = self.lock.exclusive()?;
        self.catch_up(&mut cursor)?;
        if !self.contains(key)? {
            return Ok(false);
        }
        let appended = self.log.append(LogOp::<&V>::Remove {
            key: key.to_string(),
        })?;
        cursor.offset += appended.len;
        self.write_index()?.unlink(key);
        self.maybe_compact(&mut cursor)?;
        Ok(true)
    }

    /// Removes every entry stored with `tag`; returns how many were removed.
    pub fn clear_tag(&self, tag: &str) -> Result<usize, StorageError> {
        let mut cursor = self.writer()?;
        let _guard = self.lock.exclusive()?;
        self.catch_up(&mut cursor)?;
        if !self.read_index()?.by_tag.contains_key(tag) {
            return Ok(0);
        }
        let appended = self.log.append(LogOp::<&V>::ClearTag {
            tag: tag.to_string(),
        })?;
        cursor.offset += appended.len;
        let removed = self.write_index()?.clear_tag(tag);
        self.maybe_compact(&mut cursor)?;
        Ok(removed)
    }

    fn maybe_compact(&self, cursor: &mut LogCursor) -> Result<(), StorageError> {
        if cursor.offset > self.config.max_wal_size {
            self.compact_locked(cursor)?;
        }
        Ok(())
    }

    /// Folds the log into a fresh snapshot and truncates it.
    pub fn compact(&self) -> Result<CompactionStats, StorageError> {
        let mut cursor = self.writer()?;
        let _guard = self.lock.exclusive()?;
        self.catch_up(&mut cursor)?;
        self.compact_locked(&mut cursor)
    }

    /// Requires the writer mutex and the directory lock, with `cursor`
    /// caught up.
    fn compact_locked(&self, cursor: &mut LogCursor) -> Result<CompactionStats, StorageError> {
        let log_bytes_before = self.log.size_bytes().unwrap_or(0);
        let snapshot = {
            let index = self.read_index()?;
            let mut entries: Vec<CacheEntry<V>> = index.entries.values().cloned().collect();
            entries.sort_by(|a, b| a.key.cmp(&b.key));
            Snapshot {
                created_at: Utc::now(),
                entries,
            }
        };
        let entries = snapshot.entries.len();

        self.write_snapshot(&snapshot)?;
        let generation = cursor.generation.wrapping_add(1);
        self.log.truncate(generation)?;
        *cursor = LogCursor {
            generation,
            offset: LOG_HEADER_LEN,
        };

        let stats = CompactionStats {
            entries,
            log_bytes_before,
            log_bytes_after: self.log.size_bytes().unwrap_or(0),
        };
        tracing::debug!(dir = %self.dir.display(), ?stats, generation, "Compacted cache store");
        Ok(stats)
    }

    fn write_snapshot(&self, snapshot: &Snapshot<V>) -> Result<(), StorageError> {
        let final_path = self.dir.join(SNAPSHOT_FILE);
        let temp_path = self
            .dir
            .join(format!("{SNAPSHOT_FILE}.{}.tmp", Uuid::new_v4()));
        let context = || format!("write {}", temp_path.display());

        let write = || -> std::io::Result<()> {
            let file = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&temp_path)?;
            let mut writer = BufWriter::new(file);
            codec::write_header(&mut writer)?;
            writer.write_all(&codec::encode(snapshot)?)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
            fs::rename(&temp_path, &final_path)
        };

        write().map_err(|e| {
            let _ = fs::remove_file(&temp_path);
            StorageError::io(context(), e)
        })
    }
}

fn remove_stale_temp_files(dir: &Path) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().is_some_and(|e| e == "tmp") {
            tracing::debug!(path = %path.display(), "Removing stale snapshot temp file");
            let _ = fs::remove_file(&path);
        }
    }
}
