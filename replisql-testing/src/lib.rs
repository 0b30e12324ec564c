//! Shared fixtures for the cross-crate integration tests.

use std::sync::Arc;

use replisql_core::{ConsistencyLevel, InMemoryMetrics, NodeId, QueryRequest, Result, Value};
use replisql_engine::{EndpointConfig, LocalLog, LogConfig, SqlEndpoint};
use replisql_store::{ReplicatedStore, SqlStateMachine, StoreConfig};

/// Installs a test subscriber once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .with_test_writer()
        .try_init();
}

/// A store, its state machine, a local log and an endpoint wired together.
pub struct TestNode {
    pub id: NodeId,
    pub store: Arc<ReplicatedStore>,
    pub fsm: Arc<SqlStateMachine>,
    pub log: Arc<LocalLog>,
    pub endpoint: SqlEndpoint<LocalLog>,
    pub metrics: Arc<InMemoryMetrics>,
}

impl TestNode {
    pub fn start(config: LogConfig) -> Result<Self> {
        Self::start_with(config, StoreConfig::in_memory())
    }

    pub fn start_with(config: LogConfig, store_config: StoreConfig) -> Result<Self> {
        let id = config.node_id;
        let metrics = Arc::new(InMemoryMetrics::new());
        let store = Arc::new(ReplicatedStore::new(store_config, metrics.clone())?);
        let fsm = Arc::new(SqlStateMachine::new(store.clone()));
        let (log, _driver) = LocalLog::start(config, fsm.clone(), metrics.clone());
        let log = Arc::new(log);
        let endpoint = SqlEndpoint::new(log.clone(), store.clone(), EndpointConfig::default());

        Ok(Self {
            id,
            store,
            fsm,
            log,
            endpoint,
            metrics,
        })
    }

    pub fn leader(id: u64) -> Result<Self> {
        Self::start(LogConfig::new(NodeId::from(id)))
    }
}

/// A fresh in-memory state machine to register as a replica.
pub fn replica() -> Result<Arc<SqlStateMachine>> {
    let store = ReplicatedStore::new(StoreConfig::in_memory(), Arc::new(InMemoryMetrics::new()))?;
    Ok(Arc::new(SqlStateMachine::new(Arc::new(store))))
}

/// Runs a single local read and returns its rows, panicking on SQL errors.
pub fn local_rows(store: &ReplicatedStore, sql: &str) -> Vec<Vec<Value>> {
    let response = store.query(&[sql.to_string()], false, false);
    if let Some(error) = response.first_error() {
        panic!("query {:?} failed: {}", sql, error);
    }
    response
        .rows
        .into_iter()
        .next()
        .map(|rows| rows.values)
        .unwrap_or_default()
}

/// Single integer result of a `SELECT COUNT(*)`-style query.
pub fn local_count(store: &ReplicatedStore, sql: &str) -> i64 {
    match local_rows(store, sql).first().and_then(|row| row.first()) {
        Some(Value::Integer(n)) => *n,
        other => panic!("query {:?} returned {:?}", sql, other),
    }
}

pub fn strong(sql: &str) -> QueryRequest {
    QueryRequest::new([sql]).with_level(ConsistencyLevel::Strong)
}
