//! Error types for peer bookkeeping.

use replisql_core::NodeId;
use thiserror::Error;

pub type ClusterResult<T> = Result<T, ClusterError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClusterError {
    /// No peer with this id is registered
    #[error("Peer not found: {id}")]
    PeerNotFound { id: NodeId },

    /// The peer's build tag is missing or unreadable
    #[error("Invalid build metadata: {reason}")]
    InvalidBuild { reason: String },
}

impl ClusterError {
    pub fn invalid_build(reason: impl Into<String>) -> Self {
        Self::InvalidBuild {
            reason: reason.into(),
        }
    }
}
