//! # Replisql Core
//!
//! Shared building blocks for a SQLite database whose writes are replicated
//! through a leader-based consensus log.
//!
//! ## Components
//!
//! - **Wire Data Model**: Execute/Query requests and responses, consistency
//!   levels, and the [`LogEntry`] that carries a request through consensus
//! - **StateMachine Trait**: the seam the consensus runtime drives to apply
//!   committed entries and to produce or install snapshots
//! - **ConsensusLog Trait**: the "apply an entry and wait for commit"
//!   primitive the endpoint submits through
//! - **Metrics Sink**: injected counters instead of process-wide globals
//! - **Error Handling**: the error taxonomy shared by every crate
//!
//! ## Example
//!
//! ```rust
//! use replisql_core::{ConsistencyLevel, ExecuteRequest, LogEntry, QueryRequest};
//!
//! let write = LogEntry::Execute(
//!     ExecuteRequest::new(["INSERT INTO foo(name) VALUES('fiona')"]).atomic(),
//! );
//! let bytes = write.to_bytes().unwrap();
//! assert_eq!(LogEntry::from_bytes(&bytes).unwrap(), write);
//!
//! let read = QueryRequest::new(["SELECT * FROM foo"]).with_level(ConsistencyLevel::Strong);
//! assert_eq!(read.level, ConsistencyLevel::Strong);
//! ```

pub mod consensus;
pub mod error;
pub mod messages;
pub mod metrics;
pub mod state_machine;
pub mod types;

// Re-export commonly used types for convenience
pub use consensus::ConsensusLog;
pub use error::*;
pub use messages::*;
pub use metrics::{InMemoryMetrics, MetricsSink, NoopMetrics};
pub use state_machine::{Snapshot, StateMachine};
pub use types::*;
