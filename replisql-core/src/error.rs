//! # Error Types
//!
//! Error taxonomy shared by the replicated store, the endpoint, and the log driver.

use crate::NodeId;
use thiserror::Error;

/// Error types that can occur while operating a replicated SQL store.
///
/// Statement-level failures (a malformed `INSERT`, a constraint violation)
/// are not surfaced through this type during normal Execute/Query traffic;
/// they are captured into the `error` field of the response envelope. The
/// variants here describe failures of the store itself, of snapshot
/// transfer, or of getting an entry committed through the consensus log.
///
/// # Error Categories
///
/// - **Lifecycle Errors**: operation on a store that is not open
/// - **Engine Errors**: the embedded database could not be opened or connected
/// - **Submission Errors**: this node is not the leader
/// - **Commit Errors**: quorum never reached, leadership lost mid-flight
/// - **Snapshot Errors**: backup or restore failed, checksum mismatch
///
/// # Examples
///
/// ```rust
/// use replisql_core::ReplisqlError;
///
/// let error = ReplisqlError::commit_failure("leadership lost");
/// if error.is_retryable() {
///     println!("This error can be retried");
/// }
/// ```
#[derive(Error, Debug)]
pub enum ReplisqlError {
    /// Operation attempted on a store that is closed or not yet open
    #[error("Invalid store state: {message}")]
    InvalidState { message: String },

    /// The embedded engine instance could not be created
    #[error("Engine open error: {message}")]
    EngineOpen { message: String },

    /// A connection to the embedded engine could not be established or used
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// A statement failed while being applied
    #[error("Application error: {message}")]
    Application { message: String },

    /// Submission rejected because this node is not the leader
    #[error("Not leader{}", leader_hint(.leader))]
    NotLeader { leader: Option<NodeId> },

    /// Entry was proposed but never committed
    #[error("Commit failure: {reason}")]
    CommitFailure { reason: String },

    /// Snapshot could not be installed; live state is unchanged
    #[error("Restore error: {message}")]
    Restore { message: String },

    /// Snapshot could not be produced
    #[error("Backup error: {message}")]
    Backup { message: String },

    /// Snapshot payload failed its integrity check
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Operation exceeded its timeout limit
    #[error("Timeout occurred: {operation}")]
    Timeout { operation: String },

    /// Log entry encoding or decoding failure
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// File system I/O failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Unexpected internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

fn leader_hint(leader: &Option<NodeId>) -> String {
    match leader {
        Some(id) => format!(" (current leader: {})", id),
        None => String::new(),
    }
}

/// Type alias for Results in the replisql crates.
///
/// # Examples
///
/// ```rust
/// use replisql_core::{Result, ReplisqlError};
///
/// fn open_store() -> Result<()> {
///     Err(ReplisqlError::invalid_state("store already closed"))
/// }
/// ```
pub type Result<T> = std::result::Result<T, ReplisqlError>;

impl ReplisqlError {
    /// Creates a new invalid-state error with the given message.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Creates a new engine-open error with the given message.
    pub fn engine_open(message: impl Into<String>) -> Self {
        Self::EngineOpen {
            message: message.into(),
        }
    }

    /// Creates a new connection error with the given message.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a new application error with the given message.
    pub fn application(message: impl Into<String>) -> Self {
        Self::Application {
            message: message.into(),
        }
    }

    /// Creates a new not-leader error carrying the known leader, if any.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use replisql_core::{NodeId, ReplisqlError};
    ///
    /// let error = ReplisqlError::not_leader(Some(NodeId::from(1)));
    /// assert!(error.is_not_leader());
    /// ```
    pub fn not_leader(leader: Option<NodeId>) -> Self {
        Self::NotLeader { leader }
    }

    /// Creates a new commit-failure error with the given reason.
    pub fn commit_failure(reason: impl Into<String>) -> Self {
        Self::CommitFailure {
            reason: reason.into(),
        }
    }

    /// Creates a new restore error with the given message.
    pub fn restore(message: impl Into<String>) -> Self {
        Self::Restore {
            message: message.into(),
        }
    }

    /// Creates a new backup error with the given message.
    pub fn backup(message: impl Into<String>) -> Self {
        Self::Backup {
            message: message.into(),
        }
    }

    /// Creates a new timeout error for the named operation.
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Creates a new serialization error with the given message.
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Creates a new internal error with the given message.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true when the submission was rejected because this node is
    /// not the leader.
    pub fn is_not_leader(&self) -> bool {
        matches!(self, Self::NotLeader { .. })
    }

    /// Determines if this error condition is potentially recoverable.
    ///
    /// Retryable errors are conditions where resubmitting the same request,
    /// possibly to a different node, may succeed. Engine, snapshot, and
    /// lifecycle errors are not retryable against the same store.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use replisql_core::ReplisqlError;
    ///
    /// assert!(ReplisqlError::not_leader(None).is_retryable());
    /// assert!(!ReplisqlError::restore("bad snapshot").is_retryable());
    /// ```
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NotLeader { .. } | Self::CommitFailure { .. } | Self::Timeout { .. }
        )
    }
}

impl From<bincode::Error> for ReplisqlError {
    fn from(err: bincode::Error) -> Self {
        Self::serialization(err.to_string())
    }
}
