//! # Replisql Engine
//!
//! Request routing and log plumbing for a replicated SQLite store.
//!
//! ## Key Components
//!
//! - **SqlEndpoint**: accepts execute and query requests and routes them
//!   through the consensus log or to the local store
//! - **LocalLog**: a single-process log that orders entries and applies them
//!   to a primary state machine and its replicas
//! - **EndpointConfig** / **LogConfig**: tuning for both
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use replisql_core::{ExecuteRequest, NodeId, NoopMetrics};
//! use replisql_engine::{EndpointConfig, LocalLog, LogConfig, SqlEndpoint};
//! use replisql_store::{ReplicatedStore, SqlStateMachine, StoreConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> replisql_core::Result<()> {
//!     let metrics = Arc::new(NoopMetrics);
//!     let store = Arc::new(ReplicatedStore::new(StoreConfig::in_memory(), metrics.clone())?);
//!     let fsm = Arc::new(SqlStateMachine::new(store.clone()));
//!     let (log, _driver) = LocalLog::start(LogConfig::new(NodeId::new()), fsm, metrics);
//!
//!     let endpoint = SqlEndpoint::new(Arc::new(log), store, EndpointConfig::default());
//!     endpoint
//!         .execute(ExecuteRequest::new(["CREATE TABLE foo (id INTEGER PRIMARY KEY)"]))
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod endpoint;
pub mod log;

pub use config::{EndpointConfig, LogConfig};
pub use endpoint::SqlEndpoint;
pub use log::{LocalLog, LogCommand, LogDriver, LogStats};
