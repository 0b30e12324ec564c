//! Single-process consensus log.
//!
//! [`LocalLog`] is the submission handle; [`LogDriver`] owns the ordered
//! stream of committed entries and applies each one to the primary state
//! machine and then to every replica, strictly one at a time. Entries are
//! retained in memory and compacted into snapshots, which are also used to
//! bootstrap replicas that join later.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use replisql_core::{
    ApplyOutcome, ConsensusLog, LogIndex, MetricsSink, NodeId, ReplisqlError, Result, Snapshot,
    StateMachine,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::LogConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogStats {
    pub last_index: LogIndex,
    pub snapshot_index: LogIndex,
    pub retained_entries: usize,
    pub replicas: usize,
}

pub enum LogCommand {
    Append {
        entry: Bytes,
        response_tx: oneshot::Sender<Result<ApplyOutcome>>,
    },
    AddReplica {
        replica: Arc<dyn StateMachine>,
        response_tx: oneshot::Sender<Result<()>>,
    },
    Snapshot(oneshot::Sender<Result<Snapshot>>),
    GetStats(oneshot::Sender<LogStats>),
    Shutdown,
}

pub type LogCommandSender = mpsc::UnboundedSender<LogCommand>;
pub type LogCommandReceiver = mpsc::UnboundedReceiver<LogCommand>;

/// Submission handle for the local log. Cheap to clone.
#[derive(Clone)]
pub struct LocalLog {
    node_id: NodeId,
    command_tx: LogCommandSender,
    leader_tx: Arc<watch::Sender<bool>>,
    known_leader: Arc<RwLock<Option<NodeId>>>,
    metrics: Arc<dyn MetricsSink>,
}

impl LocalLog {
    /// Build a handle and the driver that must be run for entries to commit.
    pub fn new(
        config: LogConfig,
        primary: Arc<dyn StateMachine>,
        metrics: Arc<dyn MetricsSink>,
    ) -> (Self, LogDriver) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (leader_tx, leader_rx) = watch::channel(config.initially_leader);

        let handle = Self {
            node_id: config.node_id,
            command_tx,
            leader_tx: Arc::new(leader_tx),
            known_leader: Arc::new(RwLock::new(None)),
            metrics: metrics.clone(),
        };
        let driver = LogDriver {
            config,
            primary,
            replicas: Vec::new(),
            entries: VecDeque::new(),
            last_index: LogIndex::ZERO,
            snapshot: None,
            since_snapshot: 0,
            command_rx,
            leader_rx,
            metrics,
        };
        (handle, driver)
    }

    /// Build a handle and spawn its driver on the current runtime.
    pub fn start(
        config: LogConfig,
        primary: Arc<dyn StateMachine>,
        metrics: Arc<dyn MetricsSink>,
    ) -> (Self, JoinHandle<Result<()>>) {
        let (handle, driver) = Self::new(config, primary, metrics);
        (handle, tokio::spawn(driver.run()))
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn become_leader(&self) {
        *self.known_leader.write() = None;
        self.leader_tx.send_replace(true);
        info!("Node {} is now the leader", self.node_id);
    }

    /// Give up leadership. Entries still waiting to commit fail with
    /// `CommitFailure`.
    pub fn step_down(&self, new_leader: Option<NodeId>) {
        *self.known_leader.write() = new_leader;
        if self.leader_tx.send_replace(false) {
            warn!(
                "Node {} lost leadership (new leader: {:?})",
                self.node_id, new_leader
            );
        }
    }

    /// Bring a replica up to date and include it in every later apply.
    pub async fn add_replica(&self, replica: Arc<dyn StateMachine>) -> Result<()> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(LogCommand::AddReplica {
            replica,
            response_tx,
        })?;
        response_rx.await.map_err(|_| stopped())?
    }

    /// Compact the log now instead of waiting for the threshold.
    pub async fn snapshot_now(&self) -> Result<Snapshot> {
        let (tx, rx) = oneshot::channel();
        self.send(LogCommand::Snapshot(tx))?;
        rx.await.map_err(|_| stopped())?
    }

    pub async fn stats(&self) -> Result<LogStats> {
        let (tx, rx) = oneshot::channel();
        self.send(LogCommand::GetStats(tx))?;
        rx.await.map_err(|_| stopped())
    }

    pub fn shutdown(&self) {
        let _ = self.command_tx.send(LogCommand::Shutdown);
    }

    fn send(&self, command: LogCommand) -> Result<()> {
        self.command_tx.send(command).map_err(|_| stopped())
    }
}

fn stopped() -> ReplisqlError {
    ReplisqlError::commit_failure("log driver has stopped")
}

#[async_trait]
impl ConsensusLog for LocalLog {
    async fn apply(&self, entry: Bytes) -> Result<ApplyOutcome> {
        let mut leader_rx = self.leader_tx.subscribe();
        if !*leader_rx.borrow_and_update() {
            self.metrics.increment("not_leader");
            debug!("Rejecting submission on follower {}", self.node_id);
            return Err(ReplisqlError::not_leader(self.leader()));
        }

        let (response_tx, mut response_rx) = oneshot::channel();
        self.send(LogCommand::Append { entry, response_tx })?;

        loop {
            tokio::select! {
                biased;

                result = &mut response_rx => {
                    return result.map_err(|_| stopped())?;
                }
                changed = leader_rx.changed() => {
                    // The driver may still apply or discard the entry; the
                    // caller only learns that it did not see the commit.
                    if changed.is_err() || !*leader_rx.borrow_and_update() {
                        self.metrics.increment("commit_failure");
                        return Err(ReplisqlError::commit_failure(
                            "leadership lost before the entry committed",
                        ));
                    }
                }
            }
        }
    }

    fn is_leader(&self) -> bool {
        *self.leader_tx.borrow()
    }

    fn leader(&self) -> Option<NodeId> {
        if self.is_leader() {
            Some(self.node_id)
        } else {
            *self.known_leader.read()
        }
    }
}

/// Owns the committed entry stream. Run with [`LogDriver::run`].
pub struct LogDriver {
    config: LogConfig,
    primary: Arc<dyn StateMachine>,
    replicas: Vec<Arc<dyn StateMachine>>,
    entries: VecDeque<(LogIndex, Bytes)>,
    last_index: LogIndex,
    snapshot: Option<Snapshot>,
    since_snapshot: usize,
    command_rx: LogCommandReceiver,
    leader_rx: watch::Receiver<bool>,
    metrics: Arc<dyn MetricsSink>,
}

impl LogDriver {
    pub async fn run(mut self) -> Result<()> {
        info!("Starting local log for node {}", self.config.node_id);

        while let Some(command) = self.command_rx.recv().await {
            match command {
                LogCommand::Append { entry, response_tx } => {
                    let result = self.append(entry).await;
                    let _ = response_tx.send(result);
                }
                LogCommand::AddReplica {
                    replica,
                    response_tx,
                } => {
                    let result = self.add_replica(replica).await;
                    let _ = response_tx.send(result);
                }
                LogCommand::Snapshot(tx) => {
                    let result = self.take_snapshot().await;
                    let _ = tx.send(result);
                }
                LogCommand::GetStats(tx) => {
                    let _ = tx.send(self.stats());
                }
                LogCommand::Shutdown => {
                    info!("Shutting down local log for node {}", self.config.node_id);
                    break;
                }
            }
        }

        Ok(())
    }

    async fn append(&mut self, entry: Bytes) -> Result<ApplyOutcome> {
        if !*self.leader_rx.borrow() {
            return Err(ReplisqlError::commit_failure(
                "leadership lost before the entry committed",
            ));
        }

        let index = self.last_index.next();
        let outcome = self.primary.apply(index, &entry).await?;
        for replica in &self.replicas {
            if let Err(e) = replica.apply(index, &entry).await {
                error!("Replica failed to apply entry {}: {}", index, e);
            }
        }

        self.last_index = index;
        self.entries.push_back((index, entry));
        self.since_snapshot += 1;
        self.metrics.increment("commit");
        debug!("Committed entry {}", index);

        if self.config.snapshot_threshold > 0 && self.since_snapshot >= self.config.snapshot_threshold {
            if let Err(e) = self.take_snapshot().await {
                // Wait out another full threshold before trying again
                self.since_snapshot = 0;
                self.metrics.increment("compaction_error");
                error!("Log compaction at index {} failed: {}", index, e);
            }
        }

        Ok(outcome)
    }

    async fn take_snapshot(&mut self) -> Result<Snapshot> {
        let snapshot = self.primary.snapshot().await?;
        let covered = snapshot.index();
        let before = self.entries.len();
        self.entries.retain(|(index, _)| *index > covered);

        info!(
            "Compacted log through index {} ({} entries dropped)",
            covered,
            before - self.entries.len()
        );
        self.since_snapshot = self.entries.len();
        self.snapshot = Some(snapshot.clone());
        Ok(snapshot)
    }

    async fn add_replica(&mut self, replica: Arc<dyn StateMachine>) -> Result<()> {
        if let Some(snapshot) = &self.snapshot {
            replica.restore(snapshot).await?;
        }

        let mut replayed = 0;
        for (index, entry) in &self.entries {
            if *index > replica.last_applied() {
                replica.apply(*index, entry).await?;
                replayed += 1;
            }
        }

        info!(
            "Replica caught up to index {} ({} entries replayed)",
            self.last_index, replayed
        );
        self.replicas.push(replica);
        Ok(())
    }

    fn stats(&self) -> LogStats {
        LogStats {
            last_index: self.last_index,
            snapshot_index: self
                .snapshot
                .as_ref()
                .map(|s| s.index())
                .unwrap_or(LogIndex::ZERO),
            retained_entries: self.entries.len(),
            replicas: self.replicas.len(),
        }
    }
}
