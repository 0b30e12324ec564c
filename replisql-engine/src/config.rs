use replisql_core::NodeId;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Upper bound on waiting for a submitted entry to commit
    pub commit_timeout: Duration,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            commit_timeout: Duration::from_secs(10),
        }
    }
}

impl EndpointConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_commit_timeout(mut self, timeout: Duration) -> Self {
        self.commit_timeout = timeout;
        self
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub node_id: NodeId,
    /// Entries applied between automatic snapshots; 0 disables compaction
    pub snapshot_threshold: usize,
    pub initially_leader: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId::new(),
            snapshot_threshold: 8192,
            initially_leader: true,
        }
    }
}

impl LogConfig {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            ..Self::default()
        }
    }

    pub fn with_snapshot_threshold(mut self, threshold: usize) -> Self {
        self.snapshot_threshold = threshold;
        self
    }

    pub fn as_follower(mut self) -> Self {
        self.initially_leader = false;
        self
    }
}
