//! # Embedded Engine Adapter
//!
//! Thin ownership layer over SQLite. A [`Database`] names one engine
//! instance (a file, or a shared-cache in-memory database); a
//! [`Connection`] is one handle to it and carries the statement, backup,
//! and load primitives the store is built from.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use replisql_core::{ReplisqlError, Result, SqlResult, SqlRows, Value};
use rusqlite::backup::{Backup, StepResult};
use rusqlite::types::ValueRef;
use rusqlite::OpenFlags;
use tracing::debug;

/// Pages copied per backup step unless configured otherwise.
pub const DEFAULT_PAGES_PER_STEP: i32 = 100;

/// Consecutive busy or locked steps tolerated before a copy gives up.
pub const DEFAULT_BUSY_RETRIES: u32 = 200;

const BUSY_BACKOFF: Duration = Duration::from_millis(5);

/// How a backup or load copies pages between connections.
#[derive(Debug, Clone, Copy)]
pub struct BackupPacing {
    /// Pages copied per step; zero or negative copies everything in one step
    pub pages_per_step: i32,
    pub pause: Duration,
    pub busy_retries: u32,
}

impl Default for BackupPacing {
    fn default() -> Self {
        Self {
            pages_per_step: DEFAULT_PAGES_PER_STEP,
            pause: Duration::ZERO,
            busy_retries: DEFAULT_BUSY_RETRIES,
        }
    }
}

impl BackupPacing {
    fn step_size(&self) -> i32 {
        if self.pages_per_step > 0 {
            self.pages_per_step
        } else {
            -1
        }
    }
}

/// Drives `backup` until every page is copied.
///
/// Busy and locked steps are retried with a short backoff, but only
/// `busy_retries` times in a row; the caller holds the store lock meanwhile.
fn copy_pages(backup: &Backup<'_, '_>, pacing: BackupPacing) -> rusqlite::Result<bool> {
    let pages = pacing.step_size();
    let mut stalled = 0u32;
    loop {
        match backup.step(pages)? {
            StepResult::Done => return Ok(true),
            StepResult::More => {
                stalled = 0;
                if !pacing.pause.is_zero() {
                    thread::sleep(pacing.pause);
                }
            }
            // Busy, Locked, and anything newer SQLite may report
            _ => {
                stalled += 1;
                if stalled > pacing.busy_retries {
                    return Ok(false);
                }
                thread::sleep(BUSY_BACKOFF.max(pacing.pause));
            }
        }
    }
}

#[derive(Debug, Clone)]
enum Location {
    File(PathBuf),
    Memory(String),
}

/// One embedded engine instance.
#[derive(Debug, Clone)]
pub struct Database {
    location: Location,
    dsn: String,
}

impl Database {
    /// Create a fresh engine instance.
    ///
    /// On disk, any file already at `path` is removed first: the local file
    /// is always stale relative to the replicated log and is rebuilt from a
    /// snapshot plus replayed entries. In memory, `path` is ignored and a
    /// uniquely named shared-cache database is created so that every
    /// connection of this `Database` sees the same data.
    pub fn open(path: &Path, dsn: &str, memory: bool) -> Result<Self> {
        let location = if memory {
            Location::Memory(format!("file:replisql-{}", uuid::Uuid::new_v4()))
        } else {
            match fs::remove_file(path) {
                Ok(()) => debug!("Removed stale database file {}", path.display()),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(ReplisqlError::engine_open(format!(
                        "Failed to remove stale database file {}: {}",
                        path.display(),
                        e
                    )))
                }
            }
            Location::File(path.to_path_buf())
        };

        let db = Self {
            location,
            dsn: dsn.to_string(),
        };

        // Probe once so an unusable path fails here rather than on first use
        db.raw_connect()
            .map_err(|e| ReplisqlError::engine_open(format!("{}: {}", db.describe(), e)))?;
        Ok(db)
    }

    /// Open an existing database file without touching its contents.
    pub fn open_existing(path: &Path) -> Result<Self> {
        let db = Self {
            location: Location::File(path.to_path_buf()),
            dsn: String::new(),
        };
        db.raw_connect()
            .map_err(|e| ReplisqlError::engine_open(format!("{}: {}", db.describe(), e)))?;
        Ok(db)
    }

    pub fn connect(&self) -> Result<Connection> {
        let conn = self
            .raw_connect()
            .map_err(|e| ReplisqlError::connection(format!("{}: {}", self.describe(), e)))?;
        Ok(Connection { conn })
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.location {
            Location::File(path) => Some(path),
            Location::Memory(_) => None,
        }
    }

    pub fn is_memory(&self) -> bool {
        matches!(self.location, Location::Memory(_))
    }

    fn raw_connect(&self) -> rusqlite::Result<rusqlite::Connection> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        match &self.location {
            Location::Memory(name) => {
                let mut uri = format!("{}?mode=memory&cache=shared", name);
                if !self.dsn.is_empty() {
                    uri.push('&');
                    uri.push_str(&self.dsn);
                }
                rusqlite::Connection::open_with_flags(uri, flags)
            }
            Location::File(path) if self.dsn.is_empty() => {
                rusqlite::Connection::open_with_flags(path, flags)
            }
            Location::File(path) => rusqlite::Connection::open_with_flags(
                format!("file:{}?{}", path.display(), self.dsn),
                flags,
            ),
        }
    }

    fn describe(&self) -> String {
        match &self.location {
            Location::File(path) => format!("database at {}", path.display()),
            Location::Memory(name) => format!("in-memory database {}", name),
        }
    }
}

/// One connection to a [`Database`].
#[derive(Debug)]
pub struct Connection {
    conn: rusqlite::Connection,
}

impl Connection {
    /// Run statements that modify the database.
    ///
    /// Empty statements are skipped. Each failure is recorded on its own
    /// result. With `atomic` set the batch runs in one transaction, stops at
    /// the first failure, and is rolled back; otherwise processing continues
    /// past failures.
    pub fn execute(&self, queries: &[String], atomic: bool, timings: bool) -> Result<Vec<SqlResult>> {
        let tx = if atomic {
            Some(self.conn.unchecked_transaction().map_err(|e| {
                ReplisqlError::application(format!("Failed to begin transaction: {}", e))
            })?)
        } else {
            None
        };

        let mut results = Vec::with_capacity(queries.len());
        let mut failed = false;

        for query in queries.iter().filter(|q| !q.trim().is_empty()) {
            let start = Instant::now();
            let mut result = match self.run_statement(query) {
                Ok(rows_affected) => SqlResult {
                    last_insert_id: self.conn.last_insert_rowid(),
                    rows_affected: rows_affected as i64,
                    ..Default::default()
                },
                Err(e) => SqlResult::failed(e.to_string()),
            };
            if timings {
                result.time = Some(start.elapsed().as_secs_f64());
            }

            let is_error = result.error.is_some();
            results.push(result);
            if is_error {
                failed = true;
                if atomic {
                    break;
                }
            }
        }

        if let Some(tx) = tx {
            if failed {
                tx.rollback().map_err(|e| {
                    ReplisqlError::application(format!("Failed to roll back transaction: {}", e))
                })?;
            } else {
                tx.commit().map_err(|e| {
                    ReplisqlError::application(format!("Failed to commit transaction: {}", e))
                })?;
            }
        }

        Ok(results)
    }

    /// Step a statement to completion, discarding any rows it produces, so
    /// `PRAGMA` assignments and `RETURNING` clauses behave like plain writes.
    fn run_statement(&self, query: &str) -> rusqlite::Result<u64> {
        let mut stmt = self.conn.prepare(query)?;
        let mut rows = stmt.raw_query();
        while rows.next()?.is_some() {}
        Ok(self.conn.changes())
    }

    /// Run statements that return rows. With `atomic` set every statement
    /// reads inside the same transaction.
    pub fn query(&self, queries: &[String], atomic: bool, timings: bool) -> Result<Vec<SqlRows>> {
        let tx = if atomic {
            Some(self.conn.unchecked_transaction().map_err(|e| {
                ReplisqlError::application(format!("Failed to begin transaction: {}", e))
            })?)
        } else {
            None
        };

        let mut all_rows = Vec::with_capacity(queries.len());
        for query in queries.iter().filter(|q| !q.trim().is_empty()) {
            let start = Instant::now();
            let mut rows = self
                .query_one(query)
                .unwrap_or_else(|e| SqlRows::failed(e.to_string()));
            if timings {
                rows.time = Some(start.elapsed().as_secs_f64());
            }
            all_rows.push(rows);
        }

        if let Some(tx) = tx {
            tx.commit().map_err(|e| {
                ReplisqlError::application(format!("Failed to commit transaction: {}", e))
            })?;
        }

        Ok(all_rows)
    }

    fn query_one(&self, query: &str) -> rusqlite::Result<SqlRows> {
        let mut stmt = self.conn.prepare(query)?;
        let (columns, types): (Vec<String>, Vec<String>) = stmt
            .columns()
            .iter()
            .map(|c| {
                (
                    c.name().to_string(),
                    c.decl_type().unwrap_or_default().to_lowercase(),
                )
            })
            .unzip();
        let width = columns.len();

        let mut values = Vec::new();
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let mut record = Vec::with_capacity(width);
            for i in 0..width {
                record.push(to_value(row.get_ref(i)?));
            }
            values.push(record);
        }

        Ok(SqlRows {
            columns,
            types,
            values,
            ..Default::default()
        })
    }

    /// Copy this connection's database into `dst`, page for page.
    ///
    /// Refused while a transaction is open on this connection: its
    /// uncommitted pages would keep the copy locked indefinitely.
    pub fn backup(&self, dst: &mut Connection, pacing: BackupPacing) -> Result<()> {
        if self.in_transaction() {
            return Err(ReplisqlError::backup("transaction in progress"));
        }
        let backup = Backup::new(&self.conn, &mut dst.conn)
            .map_err(|e| ReplisqlError::backup(format!("Failed to start backup: {}", e)))?;
        match copy_pages(&backup, pacing) {
            Ok(true) => Ok(()),
            Ok(false) => Err(ReplisqlError::backup("source database stayed locked")),
            Err(e) => Err(ReplisqlError::backup(format!("Backup did not complete: {}", e))),
        }
    }

    /// Replace this connection's database with the contents of `src`.
    ///
    /// SQLite applies the copy under a write lock on the destination, so
    /// later statements see either the old contents or the new ones. An
    /// open transaction on this connection is rolled back first; the load
    /// replaces whatever it would have written.
    pub fn load(&mut self, src: &Connection, pacing: BackupPacing) -> Result<()> {
        self.abort()?;
        let backup = Backup::new(&src.conn, &mut self.conn)
            .map_err(|e| ReplisqlError::restore(format!("Failed to start load: {}", e)))?;
        match copy_pages(&backup, pacing) {
            Ok(true) => Ok(()),
            Ok(false) => Err(ReplisqlError::restore("destination database stayed locked")),
            Err(e) => Err(ReplisqlError::restore(format!("Load did not complete: {}", e))),
        }
    }

    /// Fail unless the database passes SQLite's structural check.
    pub fn check_integrity(&self) -> Result<()> {
        let verdict: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get(0))
            .map_err(|e| ReplisqlError::restore(format!("Not a valid database image: {}", e)))?;
        if verdict != "ok" {
            return Err(ReplisqlError::restore(format!(
                "Database image failed integrity check: {}",
                verdict
            )));
        }
        Ok(())
    }

    /// Roll back the open transaction, if any.
    pub fn abort(&self) -> Result<()> {
        if self.conn.is_autocommit() {
            return Ok(());
        }
        debug!("Rolling back open transaction");
        self.conn
            .execute_batch("ROLLBACK")
            .map_err(|e| ReplisqlError::application(format!("Failed to abort transaction: {}", e)))
    }

    pub fn in_transaction(&self) -> bool {
        !self.conn.is_autocommit()
    }

    pub fn close(self) -> Result<()> {
        self.conn
            .close()
            .map_err(|(_, e)| ReplisqlError::connection(format!("Failed to close connection: {}", e)))
    }
}

fn to_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Integer(i),
        ValueRef::Real(f) => Value::Real(f),
        ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Blob(b.to_vec()),
    }
}
