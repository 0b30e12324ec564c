use crate::{ApplyOutcome, LogIndex, Result};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Point-in-time image of the state machine, as handed to the consensus
/// runtime for log compaction and node catch-up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// Last log index covered by this snapshot
    pub version: u64,
    pub data: Bytes,
    pub checksum: u32,
}

impl Snapshot {
    pub fn new(version: u64, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let checksum = crc32fast::hash(&data);
        Self {
            version,
            data,
            checksum,
        }
    }

    pub fn verify_checksum(&self) -> bool {
        crc32fast::hash(&self.data) == self.checksum
    }

    pub fn index(&self) -> LogIndex {
        LogIndex::new(self.version)
    }
}

/// State machine driven by the consensus log.
///
/// `apply` is called with committed entries strictly in log order, one at a
/// time. `snapshot` and `restore` are called by the runtime during
/// compaction and catch-up.
#[async_trait]
pub trait StateMachine: Send + Sync {
    async fn apply(&self, index: LogIndex, entry: &[u8]) -> Result<ApplyOutcome>;

    async fn snapshot(&self) -> Result<Snapshot>;

    async fn restore(&self, snapshot: &Snapshot) -> Result<()>;

    fn last_applied(&self) -> LogIndex;
}
