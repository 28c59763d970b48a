//! Crash recovery tests for the on-disk caches.
//!
//! These tests verify that a cache store correctly handles:
//! - Partial writes (simulated crash mid-append)
//! - CRC corruption of a log record
//! - Replay after compaction
//! - Leftover temporary snapshot files
//! - A second process writing to the same store directory

use std::fs;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::process::Command;

use sweepbench::cache::{CacheConfig, CacheStore, LOG_FILE, SNAPSHOT_FILE};
use sweepbench::Record;
use tempfile::tempdir;

fn config() -> CacheConfig {
    CacheConfig {
        sync_on_write: false,
        ..CacheConfig::default()
    }
}

fn open(dir: &Path) -> CacheStore<Record> {
    CacheStore::open(dir, &config()).unwrap()
}

fn fill(dir: &Path, n: usize) {
    let store = open(dir);
    for i in 0..n {
        store
            .put(&format!("key_{i}"), "bench", Record::new().with("i", i as i64))
            .unwrap();
    }
}

/// A log cut short mid-record keeps every complete record before the cut.
#[test]
fn test_truncated_log_tail_recovery() {
    let dir = tempdir().unwrap();
    fill(dir.path(), 5);

    {
        let file = fs::OpenOptions::new()
            .write(true)
            .open(dir.path().join(LOG_FILE))
            .unwrap();
        let size = file.metadata().unwrap().len();
        file.set_len(size - 3).unwrap();
    }

    let store = open(dir.path());
    assert_eq!(store.len().unwrap(), 4);
    assert_eq!(
        store.get("key_3").unwrap().and_then(|r| r.int("i")),
        Some(3)
    );
    assert!(store.get("key_4").unwrap().is_none());
}

/// A record failing its checksum stops replay; appends made afterwards are
/// still found on the next open.
#[test]
fn test_crc_corruption_detection() {
    let dir = tempdir().unwrap();
    fill(dir.path(), 3);

    {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .open(dir.path().join(LOG_FILE))
            .unwrap();
        let size = file.metadata().unwrap().len();
        // Last byte belongs to the final record's checksum.
        file.seek(SeekFrom::Start(size - 1)).unwrap();
        file.write_all(&[0xFF]).unwrap();
        file.flush().unwrap();
    }

    {
        let store = open(dir.path());
        assert_eq!(store.len().unwrap(), 2);
        assert!(!store.contains("key_2").unwrap());
        store
            .put("after", "bench", Record::new().with("ok", true))
            .unwrap();
    }

    let store = open(dir.path());
    assert_eq!(store.len().unwrap(), 3);
    assert_eq!(store.get("after").unwrap().and_then(|r| r.bool("ok")), Some(true));
}

/// Reopening replays the log identically every time.
#[test]
fn test_log_replay_idempotency() {
    let dir = tempdir().unwrap();
    fill(dir.path(), 4);

    let first: Vec<Option<Record>> = {
        let store = open(dir.path());
        (0..4).map(|i| store.get(&format!("key_{i}")).unwrap()).collect()
    };
    let second: Vec<Option<Record>> = {
        let store = open(dir.path());
        (0..4).map(|i| store.get(&format!("key_{i}")).unwrap()).collect()
    };
    assert_eq!(first, second);
    assert!(first.iter().all(Option::is_some));
}

/// Entries survive compaction, and later writes land in the fresh log.
#[test]
fn test_compaction_recovery() {
    let dir = tempdir().unwrap();
    {
        let store = open(dir.path());
        for i in 0..10 {
            store
                .put(&format!("key_{i}"), "bench", Record::new().with("i", i as i64))
                .unwrap();
        }
        store.remove("key_0").unwrap();
        let stats = store.compact().unwrap();
        assert_eq!(stats.entries, 9);
        assert!(stats.log_bytes_after < stats.log_bytes_before);
        store
            .put("key_10", "bench", Record::new().with("i", 10_i64))
            .unwrap();
    }

    assert!(dir.path().join(SNAPSHOT_FILE).exists());
    let store = open(dir.path());
    assert_eq!(store.len().unwrap(), 10);
    assert!(!store.contains("key_0").unwrap());
    assert_eq!(store.get("key_10").unwrap().and_then(|r| r.int("i")), Some(10));
}

/// A snapshot write interrupted before its rename leaves a temp file that
/// the next open removes without touching the live data.
#[test]
fn test_stale_snapshot_temp_file_removed() {
    let dir = tempdir().unwrap();
    fill(dir.path(), 2);
    let stale = dir.path().join(format!("{SNAPSHOT_FILE}.deadbeef.tmp"));
    fs::write(&stale, b"partial").unwrap();

    let store = open(dir.path());
    assert!(!stale.exists());
    assert_eq!(store.len().unwrap(), 2);
}

/// Clearing a tag is durable across reopen.
#[test]
fn test_clear_tag_survives_reopen() {
    let dir = tempdir().unwrap();
    {
        let store = open(dir.path());
        store.put("a", "one", Record::new().with("v", 1_i64)).unwrap();
        store.put("b", "two", Record::new().with("v", 2_i64)).unwrap();
        store.put("c", "one", Record::new().with("v", 3_i64)).unwrap();
        assert_eq!(store.clear_tag("one").unwrap(), 2);
    }
    let store = open(dir.path());
    assert_eq!(store.len().unwrap(), 1);
    assert_eq!(store.keys_with_tag("two").unwrap(), vec!["b".to_string()]);
}

const CHILD_DIR_ENV: &str = "SWEEPBENCH_SHARED_STORE_DIR";

/// A store held open by this process does not keep another process out;
/// each sees the other's keys.
#[test]
fn test_concurrent_processes_write_distinct_keys() {
    if let Some(dir) = std::env::var_os(CHILD_DIR_ENV) {
        let store = open(Path::new(&dir));
        assert!(store.get("parent").unwrap().is_some());
        store
            .put("child", "bench", Record::new().with("pid", i64::from(std::process::id())))
            .unwrap();
        return;
    }

    let dir = tempdir().unwrap();
    let store = open(dir.path());
    store
        .put("parent", "bench", Record::new().with("ok", true))
        .unwrap();

    let output = Command::new(std::env::current_exe().unwrap())
        .args([
            "--exact",
            "test_concurrent_processes_write_distinct_keys",
            "--nocapture",
            "--test-threads=1",
        ])
        .env(CHILD_DIR_ENV, dir.path())
        .output()
        .unwrap();
    assert!(output.status.success(), "child test run failed: {output:?}");

    assert!(store.get("child").unwrap().is_some());
    store
        .put("parent_after", "bench", Record::new().with("ok", true))
        .unwrap();
    drop(store);

    let store = open(dir.path());
    assert_eq!(store.len().unwrap(), 3);
    assert!(store.contains("child").unwrap());
}
