//! # Replicated Store
//!
//! Owns the node's SQLite instance and applies committed log entries to it.
//! Execute and Query share the restore lock; Restore takes it exclusively,
//! so snapshot installation never interleaves with statement traffic.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use replisql_core::{
    ExecuteResponse, MetricsSink, QueryResponse, ReplisqlError, Result, SqlResult,
};
use tracing::{debug, error, info, warn};

use crate::config::StoreConfig;
use crate::engine::{Connection, Database};

/// File written by the auto-backup worker inside its target directory.
pub const AUTO_BACKUP_FILE: &str = "db.backup";

const SNAPSHOT_PREFIX: &str = "replisql-snap-";

enum Lifecycle {
    Unopened,
    Open { db: Database, conn: Connection },
    Closed,
}

impl Lifecycle {
    fn name(&self) -> &'static str {
        match self {
            Lifecycle::Unopened => "unopened",
            Lifecycle::Open { .. } => "open",
            Lifecycle::Closed => "closed",
        }
    }
}

struct Workers {
    done_tx: Option<Sender<()>>,
    done_rx: Receiver<()>,
    handles: Vec<JoinHandle<()>>,
}

/// SQLite database whose changes are all made through consensus.
pub struct ReplicatedStore {
    config: StoreConfig,
    db_path: PathBuf,
    state: Mutex<Lifecycle>,
    closing: AtomicBool,
    restore_lock: RwLock<()>,
    workers: Mutex<Workers>,
    metrics: Arc<dyn MetricsSink>,
}

impl ReplicatedStore {
    /// Create and open a store.
    pub fn new(config: StoreConfig, metrics: Arc<dyn MetricsSink>) -> Result<Self> {
        let store = Self::unopened(config, metrics);
        store.open()?;
        Ok(store)
    }

    /// Create a store without opening it.
    pub fn unopened(config: StoreConfig, metrics: Arc<dyn MetricsSink>) -> Self {
        let (done_tx, done_rx) = crossbeam_channel::bounded(0);
        Self {
            db_path: config.db_path(),
            config,
            state: Mutex::new(Lifecycle::Unopened),
            closing: AtomicBool::new(false),
            restore_lock: RwLock::new(()),
            workers: Mutex::new(Workers {
                done_tx: Some(done_tx),
                done_rx,
                handles: Vec::new(),
            }),
            metrics,
        }
    }

    /// Build the engine instance and the utility connection.
    ///
    /// Any database file left from a previous run is deleted first. A store
    /// can be opened once; opening an open or closed store fails with
    /// `InvalidState`.
    pub fn open(&self) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            Lifecycle::Unopened => {}
            Lifecycle::Open { .. } => return Err(ReplisqlError::invalid_state("store is already open")),
            Lifecycle::Closed => {
                return Err(ReplisqlError::invalid_state("store has been closed"))
            }
        }

        if !self.config.memory {
            fs::create_dir_all(&self.config.data_dir).map_err(|e| {
                ReplisqlError::engine_open(format!(
                    "Failed to create data directory {}: {}",
                    self.config.data_dir.display(),
                    e
                ))
            })?;
        }

        let db = Database::open(&self.db_path, &self.config.dsn, self.config.memory)?;
        let conn = db.connect()?;

        if db.is_memory() {
            info!("SQLite in-memory database opened");
        } else {
            info!("SQLite database opened at {}", self.db_path.display());
        }

        *state = Lifecycle::Open { db, conn };
        Ok(())
    }

    /// Close the store. Once closed a store may not be re-opened.
    ///
    /// Signals background workers to stop and, if `wait` is set, joins them
    /// before releasing the utility connection. Closing twice is a no-op.
    pub fn close(&self, wait: bool) -> Result<()> {
        if self.closing.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let handles = {
            let mut workers = self.workers.lock();
            workers.done_tx.take();
            std::mem::take(&mut workers.handles)
        };
        if wait {
            for handle in handles {
                if handle.join().is_err() {
                    warn!("Background worker panicked before shutdown");
                }
            }
        }

        let previous = std::mem::replace(&mut *self.state.lock(), Lifecycle::Closed);
        if let Lifecycle::Open { db, conn } = previous {
            conn.close()?;
            drop(db);
            info!("Store closed");
        }
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        !self.closing.load(Ordering::Acquire) && matches!(*self.state.lock(), Lifecycle::Open { .. })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Path of the database file, or `None` when memory-only.
    pub fn path(&self) -> Option<&Path> {
        (!self.config.memory).then_some(self.db_path.as_path())
    }

    pub fn metrics(&self) -> &Arc<dyn MetricsSink> {
        &self.metrics
    }

    /// Apply statements that modify the database.
    ///
    /// Failures are reported inside the response, never as a panic or an
    /// `Err`.
    pub fn execute(&self, queries: &[String], atomic: bool, timings: bool) -> ExecuteResponse {
        let _shared = self.restore_lock.read();
        let start = Instant::now();

        let outcome = self.with_conn(|conn| conn.execute(queries, atomic, timings));
        self.finish_execute(outcome, start, timings)
    }

    /// Like [`execute`](Self::execute), but a transaction left open on the
    /// connection is rolled back if anything in the batch failed.
    pub fn execute_or_abort(&self, queries: &[String], atomic: bool, timings: bool) -> ExecuteResponse {
        let _shared = self.restore_lock.read();
        let start = Instant::now();

        let outcome = self.with_conn(|conn| {
            let results = conn.execute(queries, atomic, timings);
            let failed = match &results {
                Ok(results) => results.iter().any(|r| r.error.is_some()),
                Err(_) => true,
            };
            if failed {
                conn.abort()?;
            }
            results
        });
        self.finish_execute(outcome, start, timings)
    }

    fn finish_execute(
        &self,
        outcome: Result<Vec<SqlResult>>,
        start: Instant,
        timings: bool,
    ) -> ExecuteResponse {
        self.metrics.increment("execute");
        let mut response = match outcome {
            Ok(results) => ExecuteResponse {
                results,
                ..Default::default()
            },
            Err(e) => ExecuteResponse::failed(e.to_string()),
        };
        if timings {
            response.time = Some(start.elapsed().as_secs_f64());
        }
        if response.has_errors() {
            self.metrics.increment("execute_error");
        }
        debug!(
            "Executed {} statements, errors={}",
            response.results.len(),
            response.has_errors()
        );
        response
    }

    /// Run statements that return rows.
    pub fn query(&self, queries: &[String], atomic: bool, timings: bool) -> QueryResponse {
        let _shared = self.restore_lock.read();
        let start = Instant::now();

        self.metrics.increment("query");
        let mut response = match self.with_conn(|conn| conn.query(queries, atomic, timings)) {
            Ok(rows) => QueryResponse {
                rows,
                ..Default::default()
            },
            Err(e) => QueryResponse::failed(e.to_string()),
        };
        if timings {
            response.time = Some(start.elapsed().as_secs_f64());
        }
        if response.has_errors() {
            self.metrics.increment("query_error");
        }
        response
    }

    /// Replace the live database with a snapshot image.
    ///
    /// Blocks all Execute/Query traffic for the duration. The image is
    /// written to a temporary file, opened as a separate database, and
    /// integrity-checked before it is loaded, so a bad image leaves the live
    /// database untouched. The temporary file is removed on every path.
    pub fn restore(&self, snapshot: &[u8]) -> Result<()> {
        let _exclusive = self.restore_lock.write();
        let start = Instant::now();

        let mut temp = tempfile::Builder::new()
            .prefix(SNAPSHOT_PREFIX)
            .tempfile()
            .map_err(|e| ReplisqlError::restore(format!("Failed to create temp file: {}", e)))?;
        temp.write_all(snapshot)
            .and_then(|_| temp.flush())
            .map_err(|e| ReplisqlError::restore(format!("Failed to write snapshot: {}", e)))?;

        let source_db = Database::open_existing(temp.path())
            .map_err(|e| ReplisqlError::restore(e.to_string()))?;
        let source = source_db
            .connect()
            .map_err(|e| ReplisqlError::restore(e.to_string()))?;
        source.check_integrity()?;

        let pacing = self.config.backup_pacing();
        self.with_conn(|conn| conn.load(&source, pacing))?;
        source.close()?;

        self.metrics.increment("restore");
        info!(
            "Restored store from {} byte snapshot in {:?}",
            snapshot.len(),
            start.elapsed()
        );
        Ok(())
    }

    /// Write a byte-exact copy of the live database to `dst`.
    ///
    /// Does not take the restore lock; SQLite's backup API provides the
    /// point-in-time copy while writes continue.
    pub fn backup<W: Write>(&self, dst: &mut W) -> Result<()> {
        let temp = tempfile::Builder::new()
            .prefix(SNAPSHOT_PREFIX)
            .tempfile()
            .map_err(|e| ReplisqlError::backup(format!("Failed to create temp file: {}", e)))?;

        {
            let target_db = Database::open_existing(temp.path())
                .map_err(|e| ReplisqlError::backup(e.to_string()))?;
            let mut target = target_db
                .connect()
                .map_err(|e| ReplisqlError::backup(e.to_string()))?;
            let pacing = self.config.backup_pacing();
            self.with_conn(|conn| conn.backup(&mut target, pacing))?;
            target.close()?;
        }

        let mut image = File::open(temp.path())
            .map_err(|e| ReplisqlError::backup(format!("Failed to reopen backup: {}", e)))?;
        let copied = io::copy(&mut image, dst)
            .map_err(|e| ReplisqlError::backup(format!("Failed to stream backup: {}", e)))?;

        self.metrics.increment("backup");
        debug!("Backed up {} bytes", copied);
        Ok(())
    }

    /// Write a backup to `path`, replacing any existing file atomically.
    pub fn backup_to_file(&self, path: &Path) -> Result<()> {
        let temp_path = path.with_extension("tmp");
        let written = File::create(&temp_path)
            .map_err(ReplisqlError::from)
            .and_then(|mut file| {
                self.backup(&mut file)?;
                file.sync_all()?;
                Ok(())
            });
        if let Err(e) = written {
            let _ = fs::remove_file(&temp_path);
            return Err(e);
        }
        fs::rename(&temp_path, path)?;
        Ok(())
    }

    /// Start a worker that writes `dir/db.backup` every `interval` until the
    /// store is closed.
    pub fn start_auto_backup(self: &Arc<Self>, dir: impl Into<PathBuf>, interval: Duration) -> Result<()> {
        if interval.is_zero() {
            return Err(ReplisqlError::internal("auto-backup interval must be non-zero"));
        }
        if self.closing.load(Ordering::Acquire) {
            return Err(ReplisqlError::invalid_state("store is closing"));
        }

        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let target = dir.join(AUTO_BACKUP_FILE);

        let mut workers = self.workers.lock();
        let done_rx = workers.done_rx.clone();
        let store = Arc::downgrade(self);
        let handle = std::thread::Builder::new()
            .name("replisql-auto-backup".to_string())
            .spawn(move || auto_backup_loop(store, done_rx, target, interval))?;
        workers.handles.push(handle);

        info!("Auto-backup to {} every {:?}", dir.display(), interval);
        Ok(())
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        if self.closing.load(Ordering::Acquire) {
            return Err(ReplisqlError::invalid_state("store is closed"));
        }
        let mut state = self.state.lock();
        match &mut *state {
            Lifecycle::Open { conn, .. } => f(conn),
            other => Err(ReplisqlError::invalid_state(format!(
                "store is {}",
                other.name()
            ))),
        }
    }
}

fn auto_backup_loop(
    store: Weak<ReplicatedStore>,
    done_rx: Receiver<()>,
    target: PathBuf,
    interval: Duration,
) {
    loop {
        match done_rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {
                let Some(store) = store.upgrade() else {
                    break;
                };
                match store.backup_to_file(&target) {
                    Ok(()) => debug!("Auto-backup written to {}", target.display()),
                    Err(ReplisqlError::InvalidState { .. }) => break,
                    Err(e) => error!("Auto-backup failed: {}", e),
                }
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("Auto-backup worker stopped");
}

impl Drop for ReplicatedStore {
    fn drop(&mut self) {
        if let Err(e) = self.close(false) {
            warn!("Failed to close store on drop: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use replisql_core::{InMemoryMetrics, NoopMetrics, Value};

    fn queries(stmts: &[&str]) -> Vec<String> {
        stmts.iter().map(|s| s.to_string()).collect()
    }

    fn memory_store() -> ReplicatedStore {
        ReplicatedStore::new(StoreConfig::in_memory(), Arc::new(NoopMetrics)).unwrap()
    }

    fn count(store: &ReplicatedStore, table: &str) -> Value {
        let response = store.query(&[format!("SELECT COUNT(*) FROM {}", table)], false, false);
        assert!(!response.has_errors(), "{:?}", response.first_error());
        response.rows[0].values[0][0].clone()
    }

    #[test]
    fn test_close_is_idempotent() {
        let store = memory_store();
        assert!(store.is_open());
        store.close(true).unwrap();
        store.close(true).unwrap();
        assert!(!store.is_open());
    }

    #[test]
    fn test_no_reopen_after_close() {
        let store = memory_store();
        assert!(matches!(store.open(), Err(ReplisqlError::InvalidState { .. })));

        store.close(false).unwrap();
        assert!(matches!(store.open(), Err(ReplisqlError::InvalidState { .. })));
    }

    #[test]
    fn test_operations_on_closed_store_report_invalid_state() {
        let store = memory_store();
        store.close(true).unwrap();

        let response = store.execute(&queries(&["CREATE TABLE foo (x)"]), false, false);
        assert!(response.error.unwrap().contains("Invalid store state"));
        assert!(store.query(&queries(&["SELECT 1"]), false, false).error.is_some());
        assert!(matches!(
            store.backup(&mut Vec::new()),
            Err(ReplisqlError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_open_deletes_stale_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = StoreConfig::on_disk(dir.path());

        let first = ReplicatedStore::new(config.clone(), Arc::new(NoopMetrics)).unwrap();
        first.execute(&queries(&["CREATE TABLE foo (x)"]), false, false);
        first.close(true).unwrap();
        assert!(config.db_path().exists());

        let second = ReplicatedStore::new(config, Arc::new(NoopMetrics)).unwrap();
        let response = second.query(&queries(&["SELECT * FROM foo"]), false, false);
        assert!(response.rows[0].error.as_deref().unwrap().contains("no such table"));
    }

    #[test]
    fn test_atomic_batch_leaves_no_partial_effects() {
        let store = memory_store();
        store.execute(&queries(&["CREATE TABLE foo (name TEXT)"]), false, false);

        let response = store.execute(
            &queries(&[
                "INSERT INTO foo VALUES('first')",
                "INSERT INTO foo VALUES(",
                "INSERT INTO foo VALUES('third')",
            ]),
            true,
            true,
        );
        assert!(response.has_errors());
        assert!(response.time.is_some());
        assert_eq!(response.results.len(), 2);
        assert_eq!(count(&store, "foo"), Value::Integer(0));
    }

    #[test]
    fn test_execute_or_abort_rolls_back_client_transaction() {
        let store = memory_store();
        store.execute(&queries(&["CREATE TABLE foo (name TEXT)"]), false, false);

        let response = store.execute_or_abort(
            &queries(&["BEGIN", "INSERT INTO foo VALUES('a')"]),
            false,
            false,
        );
        assert!(!response.has_errors());

        let response = store.execute_or_abort(
            &queries(&["INSERT INTO foo VALUES('b')", "INSERT INTO missing VALUES(1)"]),
            false,
            false,
        );
        assert!(response.has_errors());
        assert_eq!(count(&store, "foo"), Value::Integer(0));
    }

    #[test]
    fn test_backup_restore_round_trip() {
        let metrics = Arc::new(InMemoryMetrics::new());
        let source = ReplicatedStore::new(StoreConfig::in_memory(), metrics.clone()).unwrap();
        source.execute(
            &queries(&[
                "CREATE TABLE foo (id INTEGER NOT NULL PRIMARY KEY, name TEXT)",
                "INSERT INTO foo(name) VALUES('fiona')",
                "INSERT INTO foo(name) VALUES('declan')",
            ]),
            true,
            false,
        );

        let mut image = Vec::new();
        source.backup(&mut image).unwrap();
        assert!(image.starts_with(b"SQLite format 3\0"));

        let target = ReplicatedStore::new(StoreConfig::in_memory(), metrics.clone()).unwrap();
        target.execute(&queries(&["CREATE TABLE other (x)"]), false, false);
        target.restore(&image).unwrap();

        let response = target.query(
            &queries(&["SELECT name FROM foo ORDER BY id", "SELECT * FROM other"]),
            false,
            false,
        );
        assert_eq!(
            response.rows[0].values,
            vec![vec![Value::from("fiona")], vec![Value::from("declan")]]
        );
        assert!(response.rows[1].error.is_some());

        // Page 1's header carries change counters that the backup API bumps;
        // everything after it must match page for page.
        let mut copy = Vec::new();
        target.backup(&mut copy).unwrap();
        assert_eq!(copy.len(), image.len());
        assert_eq!(copy[100..], image[100..]);

        assert_eq!(metrics.get("restore"), 1);
        assert_eq!(metrics.get("backup"), 2);
    }

    #[test]
    fn test_restore_rejects_garbage_and_keeps_state() {
        let store = memory_store();
        store.execute(
            &queries(&["CREATE TABLE foo (x)", "INSERT INTO foo VALUES(1)"]),
            false,
            false,
        );

        let result = store.restore(b"definitely not a database image, just some bytes");
        assert!(matches!(result, Err(ReplisqlError::Restore { .. })));
        assert_eq!(count(&store, "foo"), Value::Integer(1));
    }

    #[test]
    fn test_backup_to_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = memory_store();
        store.execute(&queries(&["CREATE TABLE foo (x)"]), false, false);

        let path = dir.path().join("manual.backup");
        store.backup_to_file(&path).unwrap();
        assert!(fs::read(&path).unwrap().starts_with(b"SQLite format 3\0"));
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_auto_backup_worker_joined_on_close() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Arc::new(memory_store());
        store.execute(&queries(&["CREATE TABLE foo (x)"]), false, false);

        store
            .start_auto_backup(dir.path(), Duration::from_millis(20))
            .unwrap();
        let target = dir.path().join(AUTO_BACKUP_FILE);
        let deadline = Instant::now() + Duration::from_secs(5);
        while !target.exists() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(target.exists());

        store.close(true).unwrap();
        assert!(store.workers.lock().handles.is_empty());
        assert!(matches!(
            store.start_auto_backup(dir.path(), Duration::from_millis(20)),
            Err(ReplisqlError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_backup_under_every_pacing() {
        for config in [
            StoreConfig::in_memory(),
            StoreConfig::in_memory().with_backup_pacing(0, Duration::ZERO),
            StoreConfig::in_memory().with_backup_pacing(1, Duration::from_millis(1)),
        ] {
            let source = ReplicatedStore::new(config.clone(), Arc::new(NoopMetrics)).unwrap();
            let mut batch = vec!["CREATE TABLE foo (x TEXT)".to_string()];
            batch.extend((0..200).map(|i| format!("INSERT INTO foo VALUES('{:0>64}')", i)));
            source.execute(&batch, true, false);

            let mut image = Vec::new();
            source.backup(&mut image).unwrap();

            let target = ReplicatedStore::new(config, Arc::new(NoopMetrics)).unwrap();
            target.restore(&image).unwrap();
            assert_eq!(count(&target, "foo"), Value::Integer(200));
        }
    }

    #[test]
    fn test_backup_refused_while_transaction_open() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Arc::new(memory_store());
        store.execute(
            &queries(&["CREATE TABLE foo (x)", "BEGIN", "INSERT INTO foo VALUES(1)"]),
            false,
            false,
        );

        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        let worker = {
            let store = store.clone();
            std::thread::spawn(move || {
                let _ = done_tx.send(store.backup(&mut Vec::new()));
            })
        };
        let result = done_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("backup did not return");
        worker.join().unwrap();
        match result {
            Err(ReplisqlError::Backup { message }) => {
                assert!(message.contains("transaction in progress"))
            }
            other => panic!("expected Backup error, got {:?}", other),
        }

        // The node keeps serving traffic
        let response = store.query(&queries(&["SELECT 1"]), false, false);
        assert!(!response.has_errors());

        let path = dir.path().join("manual.backup");
        assert!(store.backup_to_file(&path).is_err());
        assert!(!path.with_extension("tmp").exists());

        store.execute(&queries(&["COMMIT"]), false, false);
        store.backup(&mut Vec::new()).unwrap();
    }

    #[test]
    fn test_restore_discards_open_transaction() {
        let source = memory_store();
        source.execute(
            &queries(&["CREATE TABLE foo (x)", "INSERT INTO foo VALUES(1)"]),
            false,
            false,
        );
        let mut image = Vec::new();
        source.backup(&mut image).unwrap();

        let target = memory_store();
        target.execute(
            &queries(&["CREATE TABLE bar (y)", "BEGIN", "INSERT INTO bar VALUES(2)"]),
            false,
            false,
        );
        target.restore(&image).unwrap();

        assert!(!target.with_conn(|conn| Ok(conn.in_transaction())).unwrap());
        assert_eq!(count(&target, "foo"), Value::Integer(1));
        let response = target.query(&queries(&["SELECT * FROM bar"]), false, false);
        assert!(response.rows[0].error.is_some());
    }
}
