//! Replicated store facade.
//!
//! Wraps the consensus engine behind the surface the rest of the daemon
//! uses: statement execution, two-level-consistency queries, membership
//! changes, leader discovery and an observer channel.  At most one
//! writer exists (the leader); a follower asked to write fails with the
//! `NotLeader` sentinel and the caller decides whether to forward.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::cluster::engine::{Engine, EngineConfig};
use crate::cluster::peers::PeerStore;
use crate::cluster::transport::RaftTransport;
use crate::errors::ClusterError;

/// Read consistency levels.
///
/// `Weak` executes on the leader against its local state, skipping the
/// log barrier, so it may miss entries still in flight.  `Strong` is
/// linearizable: the read commits through the log before it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consistency {
    Weak,
    Strong,
}

/// Result metadata of one executed statement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecResult {
    pub last_insert_id: i64,
    pub rows_affected: u64,
    #[serde(default)]
    pub error: Option<String>,
}

impl ExecResult {
    pub(crate) fn error(message: String) -> Self {
        Self {
            last_insert_id: -1,
            rows_affected: 0,
            error: Some(message),
        }
    }
}

/// One rowset: column names, declared column types, and row values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Rows {
    pub columns: Vec<String>,
    pub types: Vec<String>,
    pub values: Vec<Vec<serde_json::Value>>,
}

/// Raft role as observed by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftRole {
    Leader,
    Follower,
    Candidate,
    PreCandidate,
    /// The engine worker has stopped.
    Shutdown,
}

/// Observations delivered to `register_observer` subscribers.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    /// The local node's role changed.
    State(RaftRole),
    /// A (possibly new) leader was observed, by address when dialable.
    Leader(Option<String>),
    /// A vote request passed through; the core ignores these.
    Vote,
}

/// Last published raft state, carried on a watch channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderState {
    pub role: RaftRole,
    pub leader_addr: Option<String>,
}

impl Default for LeaderState {
    fn default() -> Self {
        Self {
            role: RaftRole::Follower,
            leader_addr: None,
        }
    }
}

/// Handle to the replicated SQL store.
pub struct ReplicatedStore {
    engine: Engine,
}

impl ReplicatedStore {
    /// Start the store, bootstrapping as leader or waiting to be
    /// joined.
    pub fn open(
        my_addr: String,
        leader: bool,
        peers: Arc<PeerStore>,
        transport: Arc<RaftTransport>,
        request_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let engine = Engine::start(EngineConfig {
            my_addr,
            leader,
            peers,
            transport,
            request_timeout,
        })?;
        Ok(Self { engine })
    }

    /// Apply a statement batch through the log, optionally inside one
    /// transaction.  Fails with `NotLeader` on a follower.
    pub async fn execute(
        &self,
        stmts: Vec<String>,
        tx: bool,
    ) -> Result<Vec<ExecResult>, ClusterError> {
        self.engine.execute(stmts, tx).await
    }

    /// Run a query batch, one rowset per statement.
    pub async fn query(
        &self,
        stmts: Vec<String>,
        consistency: Consistency,
    ) -> Result<Vec<Rows>, ClusterError> {
        self.engine
            .query(stmts, consistency == Consistency::Strong)
            .await
    }

    /// Add a voter.  Leader-only.
    pub async fn join(&self, addr: &str) -> Result<(), ClusterError> {
        self.engine.join(addr.to_string()).await
    }

    /// Retire a voter.  Leader-only.
    pub async fn remove(&self, addr: &str) -> Result<(), ClusterError> {
        self.engine.remove(addr.to_string()).await
    }

    /// Address of the current leader, when one is known.
    pub fn leader_addr(&self) -> Option<String> {
        self.engine.leader_state().leader_addr
    }

    /// Whether the local node currently leads.
    pub fn is_leader(&self) -> bool {
        self.engine.leader_state().role == RaftRole::Leader
    }

    /// Block until a leader is known or the timer fires.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<String, ClusterError> {
        self.engine.wait_for_leader(timeout).await
    }

    /// Render a SQL dump of the replicated state, usable for bootstrap.
    pub async fn database(&self) -> Result<String, ClusterError> {
        self.engine.database().await
    }

    /// Subscribe to state, leader and vote observations.
    pub fn register_observer(&self) -> broadcast::Receiver<StoreEvent> {
        self.engine.subscribe()
    }

    /// Stop the engine worker.  Idempotent.
    pub fn shutdown(&self) {
        self.engine.shutdown()
    }
}
