use async_trait::async_trait;
use bytes::Bytes;

use crate::{ApplyOutcome, NodeId, Result};

/// The consensus runtime as seen by the endpoint.
///
/// `apply` proposes an encoded [`LogEntry`](crate::LogEntry) and resolves once
/// the entry is committed and applied locally. Implementations must fail
/// with `ReplisqlError::NotLeader` before proposing anything when this node
/// is not the leader, and with `ReplisqlError::CommitFailure` when a proposed
/// entry can no longer commit (for example because leadership was lost).
/// Entries must reach every node's state machine in the same total order.
#[async_trait]
pub trait ConsensusLog: Send + Sync {
    async fn apply(&self, entry: Bytes) -> Result<ApplyOutcome>;

    fn is_leader(&self) -> bool;

    /// Best known leader, if any.
    fn leader(&self) -> Option<NodeId>;
}
