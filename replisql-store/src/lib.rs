//! # Replisql Store
//!
//! The replicated store: one SQLite instance per node, changed only by
//! committed log entries.
//!
//! ## Components
//!
//! - **Engine Adapter** ([`engine`]): database instances, connections, and
//!   the execute/query/backup/load primitives
//! - **ReplicatedStore** ([`store`]): lifecycle, restore exclusivity, and
//!   temp-file mediated snapshot transfer
//! - **SqlStateMachine** ([`fsm`]): decodes log entries and applies them to
//!   the store on behalf of the consensus runtime
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use replisql_core::NoopMetrics;
//! use replisql_store::{ReplicatedStore, StoreConfig};
//!
//! let store = ReplicatedStore::new(StoreConfig::in_memory(), Arc::new(NoopMetrics)).unwrap();
//! let response = store.execute(&["CREATE TABLE foo (name TEXT)".to_string()], false, false);
//! assert!(!response.has_errors());
//!
//! let mut snapshot = Vec::new();
//! store.backup(&mut snapshot).unwrap();
//! store.close(true).unwrap();
//! ```

pub mod config;
pub mod engine;
pub mod fsm;
pub mod store;

pub use config::{StoreConfig, SQLITE_FILE};
pub use engine::{BackupPacing, Connection, Database};
pub use fsm::SqlStateMachine;
pub use store::{ReplicatedStore, AUTO_BACKUP_FILE};
