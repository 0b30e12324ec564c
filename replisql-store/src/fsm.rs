//! Drives a [`ReplicatedStore`] as the state machine of the consensus log.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use replisql_core::{
    ApplyOutcome, LogEntry, LogIndex, ReplisqlError, Result, Snapshot, StateMachine,
};
use tracing::{debug, info};

use crate::store::ReplicatedStore;

pub struct SqlStateMachine {
    store: Arc<ReplicatedStore>,
    last_applied: AtomicU64,
}

impl SqlStateMachine {
    pub fn new(store: Arc<ReplicatedStore>) -> Self {
        Self {
            store,
            last_applied: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &Arc<ReplicatedStore> {
        &self.store
    }
}

#[async_trait]
impl StateMachine for SqlStateMachine {
    async fn apply(&self, index: LogIndex, entry: &[u8]) -> Result<ApplyOutcome> {
        let entry = LogEntry::from_bytes(entry)?;
        debug!("Applying {} entry at index {}", entry.kind(), index);

        // SQLite calls block; keep them off the async workers
        let store = self.store.clone();
        let outcome = tokio::task::spawn_blocking(move || match entry {
            LogEntry::Execute(req) => {
                ApplyOutcome::Execute(store.execute(&req.queries, req.atomic, req.timings))
            }
            LogEntry::ExecuteOrAbort(req) => ApplyOutcome::Execute(store.execute_or_abort(
                &req.queries,
                req.atomic,
                req.timings,
            )),
            LogEntry::Query(req) => {
                ApplyOutcome::Query(store.query(&req.queries, req.atomic, req.timings))
            }
        })
        .await
        .map_err(|e| ReplisqlError::internal(format!("Apply task failed: {}", e)))?;

        self.last_applied.fetch_max(index.value(), Ordering::AcqRel);
        Ok(outcome)
    }

    async fn snapshot(&self) -> Result<Snapshot> {
        let version = self.last_applied.load(Ordering::Acquire);
        let store = self.store.clone();
        let data = tokio::task::spawn_blocking(move || {
            let mut data = Vec::new();
            store.backup(&mut data).map(|_| data)
        })
        .await
        .map_err(|e| ReplisqlError::internal(format!("Snapshot task failed: {}", e)))??;

        self.store.metrics().increment("snapshot");
        info!("Snapshot taken at index {} ({} bytes)", version, data.len());
        Ok(Snapshot::new(version, data))
    }

    async fn restore(&self, snapshot: &Snapshot) -> Result<()> {
        if !snapshot.verify_checksum() {
            return Err(ReplisqlError::ChecksumMismatch {
                expected: snapshot.checksum,
                actual: crc32fast::hash(&snapshot.data),
            });
        }

        let store = self.store.clone();
        let data = snapshot.data.clone();
        tokio::task::spawn_blocking(move || store.restore(&data))
            .await
            .map_err(|e| ReplisqlError::internal(format!("Restore task failed: {}", e)))??;

        self.last_applied.store(snapshot.version, Ordering::Release);
        info!("Installed snapshot at index {}", snapshot.version);
        Ok(())
    }

    fn last_applied(&self) -> LogIndex {
        LogIndex::new(self.last_applied.load(Ordering::Acquire))
    }
}
