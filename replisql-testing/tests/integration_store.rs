//! Store integration tests
//!
//! Lifecycle, snapshot transfer and restore exclusivity against real SQLite
//! databases, both in memory and on disk.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use replisql_core::{InMemoryMetrics, ReplisqlError};
use replisql_store::{ReplicatedStore, StoreConfig, SQLITE_FILE};
use replisql_testing::{init_tracing, local_count, local_rows};
use tempfile::TempDir;

fn sql(statements: &[&str]) -> Vec<String> {
    statements.iter().map(|s| s.to_string()).collect()
}

fn store_with_rows(config: StoreConfig, rows: usize) -> ReplicatedStore {
    let store = ReplicatedStore::new(config, Arc::new(InMemoryMetrics::new()))
        .expect("Failed to open store");
    let mut batch = vec!["CREATE TABLE t (id INTEGER PRIMARY KEY, payload TEXT)".to_string()];
    for i in 0..rows {
        batch.push(format!("INSERT INTO t(payload) VALUES('row-{}')", i));
    }
    let response = store.execute(&batch, true, false);
    assert!(!response.has_errors(), "seed failed: {:?}", response.first_error());
    store
}

fn snapshot_of(store: &ReplicatedStore) -> Vec<u8> {
    let mut image = Vec::new();
    store.backup(&mut image).expect("Backup failed");
    image
}

#[test]
fn test_on_disk_store_lifecycle() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let store = store_with_rows(StoreConfig::on_disk(dir.path()), 3);

    assert!(dir.path().join(SQLITE_FILE).exists());
    assert_eq!(local_count(&store, "SELECT COUNT(*) FROM t"), 3);

    store.close(true).unwrap();
    store.close(true).unwrap();
    assert!(!store.is_open());

    let after = store.execute(&sql(&["INSERT INTO t(payload) VALUES('late')"]), false, false);
    assert!(after.has_errors());
    assert!(matches!(store.open(), Err(ReplisqlError::InvalidState { .. })));
}

#[test]
fn test_reopen_of_same_directory_starts_empty() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let first = store_with_rows(StoreConfig::on_disk(dir.path()), 2);
    first.close(true).unwrap();

    let second = ReplicatedStore::new(
        StoreConfig::on_disk(dir.path()),
        Arc::new(InMemoryMetrics::new()),
    )
    .unwrap();
    let tables = local_rows(&second, "SELECT name FROM sqlite_master WHERE type = 'table'");
    assert!(tables.is_empty(), "stale tables survived: {:?}", tables);
}

#[test]
fn test_snapshot_moves_between_disk_and_memory() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let source = store_with_rows(StoreConfig::on_disk(dir.path()), 10);

    let target = ReplicatedStore::new(StoreConfig::in_memory(), Arc::new(InMemoryMetrics::new()))
        .unwrap();
    target.restore(&snapshot_of(&source)).unwrap();

    assert_eq!(
        local_rows(&target, "SELECT payload FROM t ORDER BY id LIMIT 1"),
        local_rows(&source, "SELECT payload FROM t ORDER BY id LIMIT 1"),
    );
    assert_eq!(local_count(&target, "SELECT COUNT(*) FROM t"), 10);
}

#[test]
fn test_restore_is_exclusive_with_reads() {
    init_tracing();
    let store = Arc::new(store_with_rows(StoreConfig::in_memory(), 200));
    let snapshot = snapshot_of(&store_with_rows(StoreConfig::in_memory(), 5));

    const READERS: usize = 4;
    let start = Arc::new(Barrier::new(READERS + 1));
    let restoring = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..READERS)
        .map(|_| {
            let store = store.clone();
            let start = start.clone();
            let restoring = restoring.clone();
            thread::spawn(move || {
                let mut seen = Vec::new();
                start.wait();
                // Keep reading until the restore is visibly over
                loop {
                    let done = !restoring.load(Ordering::Acquire) && !seen.is_empty();
                    let count = local_count(&store, "SELECT COUNT(*) FROM t");
                    seen.push(count);
                    if done && count == 5 {
                        break;
                    }
                }
                seen
            })
        })
        .collect();

    restoring.store(true, Ordering::Release);
    start.wait();
    store.restore(&snapshot).unwrap();
    restoring.store(false, Ordering::Release);

    for reader in readers {
        let seen = reader.join().unwrap();
        for count in &seen {
            assert!(*count == 200 || *count == 5, "observed partial state: {}", count);
        }
        assert_eq!(seen.last(), Some(&5));
    }
    assert_eq!(local_count(&store, "SELECT COUNT(*) FROM t"), 5);

    let response = store.execute(&sql(&["INSERT INTO t(payload) VALUES('after')"]), false, false);
    assert!(!response.has_errors());
    assert_eq!(local_count(&store, "SELECT COUNT(*) FROM t"), 6);
}

#[test]
fn test_backup_runs_alongside_writes() {
    init_tracing();
    let store = Arc::new(store_with_rows(StoreConfig::in_memory(), 50));

    let writer = {
        let store = store.clone();
        thread::spawn(move || {
            for i in 0..50 {
                let response = store.execute(
                    &[format!("INSERT INTO t(payload) VALUES('w-{}')", i)],
                    false,
                    false,
                );
                assert!(!response.has_errors());
            }
        })
    };
    let image = snapshot_of(&store);
    writer.join().unwrap();

    let copy = ReplicatedStore::new(StoreConfig::in_memory(), Arc::new(InMemoryMetrics::new()))
        .unwrap();
    copy.restore(&image).unwrap();
    let count = local_count(&copy, "SELECT COUNT(*) FROM t");
    assert!((50..=100).contains(&count), "unexpected row count {}", count);
}
