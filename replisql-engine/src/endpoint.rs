//! Client-facing entry point for SQL requests.
//!
//! Writes and strong reads are encoded as log entries and go through
//! consensus. Weak reads only check local leadership; reads at level
//! `None` are served straight from the local store.

use std::sync::Arc;

use bytes::Bytes;
use replisql_core::{
    ApplyOutcome, ConsensusLog, ConsistencyLevel, ExecuteRequest, ExecuteResponse, LogEntry,
    QueryRequest, QueryResponse, ReplisqlError, Result,
};
use replisql_store::ReplicatedStore;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::EndpointConfig;

/// A follower answers with `NotLeader` carrying the known leader, so a
/// caller can forward the request there.
pub struct SqlEndpoint<L: ConsensusLog> {
    log: Arc<L>,
    store: Arc<ReplicatedStore>,
    config: EndpointConfig,
}

impl<L: ConsensusLog> SqlEndpoint<L> {
    pub fn new(log: Arc<L>, store: Arc<ReplicatedStore>, config: EndpointConfig) -> Self {
        Self { log, store, config }
    }

    pub fn log(&self) -> &Arc<L> {
        &self.log
    }

    pub fn store(&self) -> &Arc<ReplicatedStore> {
        &self.store
    }

    pub async fn execute(&self, request: ExecuteRequest) -> Result<ExecuteResponse> {
        self.submit_write(LogEntry::Execute(request)).await
    }

    /// Like [`execute`](Self::execute), but an open transaction left behind
    /// by the batch is rolled back on every node.
    pub async fn execute_or_abort(&self, request: ExecuteRequest) -> Result<ExecuteResponse> {
        self.submit_write(LogEntry::ExecuteOrAbort(request)).await
    }

    pub async fn query(&self, request: QueryRequest) -> Result<QueryResponse> {
        match request.level {
            ConsistencyLevel::Strong => match self.submit(LogEntry::Query(request)).await? {
                ApplyOutcome::Query(response) => Ok(response),
                other => Err(unexpected(other)),
            },
            ConsistencyLevel::Weak => {
                if !self.log.is_leader() {
                    warn!("Weak read refused: this node is not the leader");
                    return Err(ReplisqlError::not_leader(self.log.leader()));
                }
                self.query_local(request).await
            }
            ConsistencyLevel::None => self.query_local(request).await,
        }
    }

    async fn submit_write(&self, entry: LogEntry) -> Result<ExecuteResponse> {
        match self.submit(entry).await? {
            ApplyOutcome::Execute(response) => Ok(response),
            other => Err(unexpected(other)),
        }
    }

    async fn submit(&self, entry: LogEntry) -> Result<ApplyOutcome> {
        let kind = entry.kind();
        let data = Bytes::from(entry.to_bytes()?);
        debug!("Submitting {} entry ({} bytes)", kind, data.len());

        match timeout(self.config.commit_timeout, self.log.apply(data)).await {
            Ok(result) => result.map_err(|e| {
                if e.is_not_leader() {
                    warn!("Submission of {} entry refused: {}", kind, e);
                }
                e
            }),
            Err(_) => {
                warn!(
                    "{} entry not committed within {:?}",
                    kind, self.config.commit_timeout
                );
                Err(ReplisqlError::timeout(format!("commit of {} entry", kind)))
            }
        }
    }

    async fn query_local(&self, request: QueryRequest) -> Result<QueryResponse> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || {
            store.query(&request.queries, request.atomic, request.timings)
        })
        .await
        .map_err(|e| ReplisqlError::internal(format!("Local query task failed: {}", e)))
    }
}

fn unexpected(outcome: ApplyOutcome) -> ReplisqlError {
    ReplisqlError::internal(format!("unexpected {} outcome from log", outcome.kind()))
}
