//! Append-only operation log of a cache store.
//!
//! Every mutation of a store is appended here before it is applied to the
//! in-memory index, and the log is replayed on open. Several handles may
//! append to one log; each reads the records the others added by resuming
//! from the offset it last reached. The generation in the header changes
//! whenever the log is truncated, so a stale offset is never reused.
//!
//! # File Format
//! ```text
//! [MAGIC: 4 bytes][VERSION: 1 byte][GENERATION: 8 bytes LE]
//! [RECORD 1: codec-framed LogRecord]
//! [RECORD 2: codec-framed LogRecord]
//! ...
//! ```

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Result as IoResult, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::codec;
use crate::error::StorageError;

/// One logged mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum LogOp<V> {
    Put {
        key: String,
        tag: String,
        value: V,
        stored_at: DateTime<Utc>,
    },
    Remove {
        key: String,
    },
    ClearTag {
        tag: String,
    },
}

/// Size of the log header: the codec header plus the generation.
pub const LOG_HEADER_LEN: u64 = codec::HEADER_LEN + 8;

fn write_log_header(writer: &mut impl Write, generation: u64) -> IoResult<()> {
    codec::write_header(writer)?;
    writer.write_all(&generation.to_le_bytes())
}

fn read_log_header(reader: &mut impl Read) -> IoResult<u64> {
    codec::read_header(reader)?;
    let mut generation = [0u8; 8];
    reader.read_exact(&mut generation)?;
    Ok(u64::from_le_bytes(generation))
}

/// Result of one append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Appended {
    pub sequence: u64,
    /// Encoded size of the record in bytes.
    pub len: u64,
}

/// A sequenced log record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord<V> {
    pub sequence: u64,
    pub op: LogOp<V>,
}

struct Appender {
    writer: BufWriter<File>,
    sequence: u64,
}

/// Append-only log file. Appends are serialised by an internal mutex.
pub struct CacheLog {
    path: PathBuf,
    appender: Mutex<Appender>,
    sync_on_write: bool,
}

impl CacheLog {
    /// Opens or creates the log at `path`.
    ///
    /// A missing or header-less file is (re)initialised with a header of
    /// generation 0. Callers sharing the file must hold its directory lock.
    pub fn open(path: &Path, sync_on_write: bool) -> IoResult<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        if file.metadata()?.len() < LOG_HEADER_LEN {
            file.set_len(0)?;
            write_log_header(&mut file, 0)?;
            if sync_on_write {
                file.sync_all()?;
            }
        }
        drop(file);

        let file = OpenOptions::new().append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            appender: Mutex::new(Appender {
                writer: BufWriter::new(file),
                sequence: 0,
            }),
            sync_on_write,
        })
    }

    fn appender(&self) -> Result<std::sync::MutexGuard<'_, Appender>, StorageError> {
        self.appender
            .lock()
            .map_err(|_| StorageError::Poisoned { context: "cache.log" })
    }

    /// Appends `op` at the end of the file, flushing (and syncing when
    /// configured) before returning.
    pub fn append<V: Serialize>(&self, op: LogOp<V>) -> Result<Appended, StorageError> {
        let mut appender = self.appender()?;
        let sequence = appender.sequence + 1;
        let encoded = codec::encode(&LogRecord { sequence, op })
            .map_err(|e| StorageError::Serialization {
                message: e.to_string(),
            })?;

        let context = || format!("append {}", self.path.display());
        appender
            .writer
            .write_all(&encoded)
            .map_err(|e| StorageError::io(context(), e))?;
        appender
            .writer
            .flush()
            .map_err(|e| StorageError::io(context(), e))?;
        if self.sync_on_write {
            appender
                .writer
                .get_ref()
                .sync_data()
                .map_err(|e| StorageError::io(context(), e))?;
        }
        appender.sequence = sequence;
        Ok(Appended {
            sequence,
            len: encoded.len() as u64,
        })
    }

    /// Continues sequence numbering after a replay.
    pub fn resume_at(&self, sequence: u64) -> Result<(), StorageError> {
        self.appender()?.sequence = sequence;
        Ok(())
    }

    /// Continues sequence numbering after records appended by another
    /// handle. Never moves the sequence backwards.
    pub fn observe(&self, sequence: u64) -> Result<(), StorageError> {
        let mut appender = self.appender()?;
        appender.sequence = appender.sequence.max(sequence);
        Ok(())
    }

    /// Sequence number of the last appended record.
    pub fn sequence(&self) -> Result<u64, StorageError> {
        Ok(self.appender()?.sequence)
    }

    /// Reads records from the start of the log.
    pub fn iter<V: DeserializeOwned>(&self) -> IoResult<LogIter<V>> {
        LogIter::new(&self.path, LOG_HEADER_LEN)
    }

    /// Reads records starting at byte `offset`, as returned by an earlier
    /// [`LogIter::valid_end`]. The offset is only meaningful while
    /// [`LogIter::generation`] is unchanged.
    pub fn iter_from<V: DeserializeOwned>(&self, offset: u64) -> IoResult<LogIter<V>> {
        LogIter::new(&self.path, offset.max(LOG_HEADER_LEN))
    }

    /// Log file size in bytes.
    pub fn size_bytes(&self) -> IoResult<u64> {
        Ok(std::fs::metadata(&self.path)?.len())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Empties the log back to a bare header stamped with `generation`.
    /// Call only after the state it holds has been written to a snapshot.
    pub fn truncate(&self, generation: u64) -> Result<(), StorageError> {
        let mut appender = self.appender()?;
        let context = || format!("truncate {}", self.path.display());
        appender
            .writer
            .flush()
            .map_err(|e| StorageError::io(context(), e))?;

        let mut file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&self.path)
            .map_err(|e| StorageError::io(context(), e))?;
        write_log_header(&mut file, generation).map_err(|e| StorageError::io(context(), e))?;
        if self.sync_on_write {
            file.sync_all().map_err(|e| StorageError::io(context(), e))?;
        }

        let file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|e| StorageError::io(context(), e))?;
        appender.writer = BufWriter::new(file);
        appender.sequence = 0;
        Ok(())
    }
}

/// Iterator over log records.
///
/// Stops at end of file and at a record cut short by a crash. A record that
/// fails its checksum or cannot be decoded is yielded as an error; callers
/// should stop there. [`LogIter::clean`] reports whether every byte of the
/// file was consumed by valid records.
pub struct LogIter<V> {
    reader: BufReader<File>,
    generation: u64,
    file_size: u64,
    valid_end: u64,
    clean: bool,
    _marker: PhantomData<V>,
}

impl<V> LogIter<V> {
    fn new(path: &Path, start: u64) -> IoResult<Self> {
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let generation = read_log_header(&mut reader)?;
        if start > LOG_HEADER_LEN {
            reader.seek(SeekFrom::Start(start))?;
        }
        Ok(Self {
            reader,
            generation,
            file_size,
            valid_end: start,
            clean: true,
            _marker: PhantomData,
        })
    }

    /// Generation stamped in the log header.
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Offset just past the last valid record.
    pub const fn valid_end(&self) -> u64 {
        self.valid_end
    }

    /// False once a truncated or corrupt record was met.
    pub const fn clean(&self) -> bool {
        self.clean
    }
}

impl<V: DeserializeOwned> Iterator for LogIter<V> {
    type Item = IoResult<LogRecord<V>>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.clean || self.valid_end >= self.file_size {
            return None;
        }

        match codec::decode::<LogRecord<V>>(&mut self.reader) {
            Ok(record) => match self.reader.stream_position() {
                Ok(pos) => {
                    self.valid_end = pos;
                    Some(Ok(record))
                }
                Err(e) => {
                    self.clean = false;
                    Some(Err(e))
                }
            },
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                self.clean = false;
                None
            }
            Err(e) => {
                self.clean = false;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn put(key: &str, value: f64) -> LogOp<f64> {
        LogOp::Put {
            key: key.to_string(),
            tag: String::new(),
            value,
            stored_at: Utc::now(),
        }
    }

    #[test]
    fn test_append_and_iterate() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.wal");

        let log = CacheLog::open(&path, false).unwrap();
        assert_eq!(log.append(put("a", 1.0)).unwrap().sequence, 1);
        assert_eq!(
            log.append(LogOp::<f64>::Remove { key: "a".into() }).unwrap().sequence,
            2
        );
        drop(log);

        let log = CacheLog::open(&path, false).unwrap();
        let mut iter = log.iter::<f64>().unwrap();
        let records: Vec<_> = iter.by_ref().collect::<Result<_, _>>().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].sequence, 1);
        assert!(matches!(records[1].op, LogOp::Remove { .. }));
        assert!(iter.clean());
    }

    #[test]
    fn test_truncated_tail_stops_iteration() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.wal");
        let log = CacheLog::open(&path, true).unwrap();
        log.append(put("a", 1.0)).unwrap();
        log.append(put("b", 2.0)).unwrap();
        let full = log.size_bytes().unwrap();
        drop(log);

        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(full - 2).unwrap();

        let log = CacheLog::open(&path, true).unwrap();
        let mut iter = log.iter::<f64>().unwrap();
        let records: Vec<_> = iter.by_ref().filter_map(Result::ok).collect();
        assert_eq!(records.len(), 1);
        assert!(!iter.clean());
        assert!(iter.valid_end() < full - 2);
    }

    #[test]
    fn test_truncate_resets_log() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.wal");
        let log = CacheLog::open(&path, false).unwrap();
        log.append(put("a", 1.0)).unwrap();
        log.truncate(3).unwrap();
        assert_eq!(log.size_bytes().unwrap(), LOG_HEADER_LEN);
        assert_eq!(log.sequence().unwrap(), 0);
        let iter = log.iter::<f64>().unwrap();
        assert_eq!(iter.generation(), 3);
        assert_eq!(iter.count(), 0);
    }

    #[test]
    fn test_iter_from_reads_records_of_other_handles() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.wal");
        let mine = CacheLog::open(&path, false).unwrap();
        let theirs = CacheLog::open(&path, false).unwrap();

        let first = mine.append(put("a", 1.0)).unwrap();
        let offset = LOG_HEADER_LEN + first.len;
        theirs.append(put("b", 2.0)).unwrap();
        theirs.append(put("c", 3.0)).unwrap();

        let mut iter = mine.iter_from::<f64>(offset).unwrap();
        let keys: Vec<String> = iter
            .by_ref()
            .map(|r| match r.unwrap().op {
                LogOp::Put { key, .. } => key,
                other => panic!("unexpected op {other:?}"),
            })
            .collect();
        assert_eq!(keys, vec!["b", "c"]);
        assert!(iter.clean());
        assert_eq!(iter.valid_end(), mine.size_bytes().unwrap());
        assert_eq!(mine.iter_from::<f64>(iter.valid_end()).unwrap().count(), 0);
    }
}
