//! # Core Types
//!
//! Identifiers shared across the replicated store, the log driver, and the
//! peer directory.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a node in the cluster.
///
/// # Examples
///
/// ```rust
/// use replisql_core::NodeId;
///
/// let node_id = NodeId::new();
/// println!("Node ID: {}", node_id);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub Uuid);

impl NodeId {
    /// Creates a new random node identifier.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use replisql_core::NodeId;
    ///
    /// let node_id = NodeId::new();
    /// assert_ne!(node_id, NodeId::new()); // Should be unique
    /// ```
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for NodeId {
    fn from(id: u64) -> Self {
        // Deterministic ids for tests and static cluster definitions
        let mut bytes = [0u8; 16];
        bytes[0..8].copy_from_slice(&id.to_be_bytes());
        Self(Uuid::from_bytes(bytes))
    }
}

/// Position of a committed entry in the consensus log.
///
/// Indexes start at 1; `LogIndex::ZERO` means "nothing applied yet".
///
/// # Examples
///
/// ```rust
/// use replisql_core::LogIndex;
///
/// let first = LogIndex::ZERO.next();
/// assert_eq!(first.value(), 1);
/// assert!(first.next() > first);
/// ```
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct LogIndex(pub u64);

impl LogIndex {
    pub const ZERO: LogIndex = LogIndex(0);

    pub fn new(index: u64) -> Self {
        Self(index)
    }

    /// Returns the next index in sequence.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for LogIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
