use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::engine::{BackupPacing, DEFAULT_BUSY_RETRIES, DEFAULT_PAGES_PER_STEP};

/// Name of the database file inside the node's data directory.
pub const SQLITE_FILE: &str = "db.sqlite";

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub data_dir: PathBuf,
    /// Extra SQLite URI parameters, e.g. `_busy_timeout=5000`
    pub dsn: String,
    pub memory: bool,
    /// Pages per backup step; zero or negative copies in a single step
    pub backup_pages_per_step: i32,
    pub backup_step_pause: Duration,
    pub backup_busy_retries: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            dsn: String::new(),
            memory: true,
            backup_pages_per_step: DEFAULT_PAGES_PER_STEP,
            backup_step_pause: Duration::ZERO,
            backup_busy_retries: DEFAULT_BUSY_RETRIES,
        }
    }
}

impl StoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn on_disk(data_dir: impl AsRef<Path>) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            memory: false,
            ..Self::default()
        }
    }

    pub fn with_dsn(mut self, dsn: impl Into<String>) -> Self {
        self.dsn = dsn.into();
        self
    }

    pub fn with_backup_pacing(mut self, pages_per_step: i32, pause: Duration) -> Self {
        self.backup_pages_per_step = pages_per_step;
        self.backup_step_pause = pause;
        self
    }

    pub fn with_backup_busy_retries(mut self, retries: u32) -> Self {
        self.backup_busy_retries = retries;
        self
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(SQLITE_FILE)
    }

    pub fn backup_pacing(&self) -> BackupPacing {
        BackupPacing {
            pages_per_step: self.backup_pages_per_step,
            pause: self.backup_step_pause,
            busy_retries: self.backup_busy_retries,
        }
    }
}
