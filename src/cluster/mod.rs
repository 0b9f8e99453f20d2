//! Clustered control plane.
//!
//! Turns a set of independent daemons into one replicated cluster: the
//! shared state is a replicated SQL database, peers authenticate each
//! other over pinned TLS, and requests are forwarded to the leader or
//! to the node owning a resource.
//!
//! [`ClusterRuntime`] collects the transport, the peer store and the
//! replicated store in a single value owned by the daemon; the presence
//! of a runtime (and so of its transport) is the cluster-mode flag.

pub mod driver;
pub(crate) mod engine;
pub mod forward;
pub mod peers;
pub mod store;
pub mod transport;
pub mod ws;

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{error, info};

use crate::client::ClusterClient;
use crate::errors::ClusterError;
use crate::tls::TlsIdentity;
use crate::AppState;
use self::peers::{ClusterMember, PeerStore};
use self::store::{Consistency, ExecResult, RaftRole, ReplicatedStore, Rows, StoreEvent};
use self::transport::RaftTransport;

/// Applied ahead of the schema so the `operations` reference is
/// enforced.
pub const ENABLE_FOREIGN_KEYS: &str = "PRAGMA foreign_keys = ON";

/// Replicated schema, one statement per entry.
pub const CURRENT_SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS cluster_nodes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        addr TEXT UNIQUE,
        name TEXT UNIQUE,
        certificate TEXT
    )",
    "CREATE TABLE IF NOT EXISTS operations (
        uuid TEXT PRIMARY KEY,
        cluster_id INTEGER REFERENCES cluster_nodes(id)
    )",
];

/// The live clustering state of a daemon.
pub struct ClusterRuntime {
    my_addr: String,
    pub transport: Arc<RaftTransport>,
    pub peers: Arc<PeerStore>,
    pub store: ReplicatedStore,
    identity: TlsIdentity,
    request_timeout: Duration,
    raft_dir: PathBuf,
}

impl ClusterRuntime {
    /// Start clustering: open the peer store, bring up the transport
    /// and the replicated store, and hand back the runtime.  The
    /// observer loop is spawned by [`AppState::enable_cluster`], which
    /// owns the slot the runtime lives in.
    pub fn start(
        my_addr: String,
        leader: bool,
        identity: TlsIdentity,
        raft_dir: PathBuf,
        request_timeout: Duration,
    ) -> anyhow::Result<Arc<Self>> {
        info!("starting replicated store on {my_addr}");
        std::fs::create_dir_all(&raft_dir)?;

        let peers = Arc::new(PeerStore::open(&raft_dir)?);
        let transport = Arc::new(RaftTransport::new(
            my_addr.clone(),
            identity.clone(),
            peers.clone(),
        ));
        let store = ReplicatedStore::open(
            my_addr.clone(),
            leader,
            peers.clone(),
            transport.clone(),
            request_timeout,
        )?;

        Ok(Arc::new(Self {
            my_addr,
            transport,
            peers,
            store,
            identity,
            request_timeout,
            raft_dir,
        }))
    }

    /// The local cluster address.
    pub fn my_addr(&self) -> &str {
        &self.my_addr
    }

    /// The configured per-request network deadline.
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// The local node's TLS identity, presented on every outbound hop.
    pub fn identity(&self) -> &TlsIdentity {
        &self.identity
    }

    /// Stop the store and close the transport, keeping the on-disk
    /// consensus state so the node can rejoin after a restart.
    pub fn stop(&self) {
        self.store.shutdown();
        self.transport.close();
    }

    /// Leave for good: stop, then wipe the consensus state directory
    /// (including the peer-store snapshot).
    pub fn teardown(&self) {
        self.stop();
        if let Err(err) = std::fs::remove_dir_all(&self.raft_dir) {
            if err.kind() != std::io::ErrorKind::NotFound {
                error!("failed to remove raft directory: {err}");
            }
        }
    }

    /// The cluster name of the local node.
    pub fn my_name(&self) -> Option<String> {
        self.peers.member_by_addr(&self.my_addr).ok().map(|m| m.name)
    }

    /// The local node's row id in `cluster_nodes`.
    pub async fn my_cluster_id(&self) -> Result<i64, ClusterError> {
        let sql = format!(
            "SELECT id FROM cluster_nodes WHERE addr = '{}'",
            self.my_addr.replace('\'', "''")
        );
        let rows = self.cluster_db_query(&sql).await?;
        rows.values
            .first()
            .and_then(|row| row.first())
            .and_then(|v| v.as_i64())
            .ok_or_else(|| ClusterError::NoSuchMember(self.my_addr.clone()))
    }

    /// The current leader, as a full member record.
    pub fn leader_member(&self) -> Result<ClusterMember, ClusterError> {
        let addr = self.store.leader_addr().ok_or(ClusterError::NotLeader)?;
        self.peers.member_by_addr(&addr)
    }

    /// Run one weak-consistency query, re-routing to the leader over
    /// HTTP when the local node cannot serve it.
    pub async fn cluster_db_query(&self, sql: &str) -> Result<Rows, ClusterError> {
        match self
            .store
            .query(vec![sql.to_string()], Consistency::Weak)
            .await
        {
            Ok(mut rows) => {
                if rows.len() != 1 {
                    return Err(ClusterError::Protocol(format!(
                        "wrong number of rowsets, got {}",
                        rows.len()
                    )));
                }
                Ok(rows.remove(0))
            }
            Err(err) if err.is_not_leader() => {
                let client = self.leader_client()?;
                client.cluster_db_query(sql).await
            }
            Err(err) => Err(err),
        }
    }

    /// Execute one statement, re-routing to the leader over HTTP when
    /// the local node cannot serve it.
    pub async fn cluster_db_execute(&self, sql: &str) -> Result<ExecResult, ClusterError> {
        match self.store.execute(vec![sql.to_string()], false).await {
            Ok(results) => {
                let result = results
                    .into_iter()
                    .next()
                    .ok_or_else(|| ClusterError::Protocol("empty execute result".into()))?;
                if let Some(message) = &result.error {
                    return Err(ClusterError::Schema(message.clone()));
                }
                Ok(result)
            }
            Err(err) if err.is_not_leader() => {
                let client = self.leader_client()?;
                let result = client.cluster_db_execute(sql).await?;
                if let Some(message) = &result.error {
                    return Err(ClusterError::Schema(message.clone()));
                }
                Ok(result)
            }
            Err(err) => Err(err),
        }
    }

    /// Build a client for the current leader, preferring the DB-sourced
    /// certificate and falling back to the one-shot certificate
    /// captured from the first inbound raft connection.
    pub fn leader_client(&self) -> Result<ClusterClient, ClusterError> {
        match self.leader_member() {
            Ok(leader) => {
                ClusterClient::connect_to(&leader, &self.identity, self.request_timeout)
            }
            Err(member_err) => {
                // A freshly-joined follower knows the leader only from
                // the upgrade that just joined it.
                let cert = self
                    .peers
                    .take_first_leader_cert()
                    .ok_or(member_err)?;
                let addr = self.store.leader_addr().ok_or(ClusterError::NotLeader)?;
                ClusterClient::connect(&addr, &cert.to_pem(), &self.identity, self.request_timeout)
            }
        }
    }

    /// Re-read the member list and persist it.  On the leader this is
    /// a local read of `cluster_nodes`; a follower asks the leader.
    pub async fn refresh_members(&self) -> Result<(), ClusterError> {
        let members = self.fetch_members().await?;
        self.peers
            .set_members(members)
            .map_err(ClusterError::Internal)?;
        Ok(())
    }

    async fn fetch_members(&self) -> Result<Vec<ClusterMember>, ClusterError> {
        match self
            .store
            .query(
                vec!["SELECT name, addr, certificate FROM cluster_nodes".to_string()],
                Consistency::Weak,
            )
            .await
        {
            Ok(rows) => {
                let leader_addr = self.store.leader_addr();
                let rowset = rows
                    .into_iter()
                    .next()
                    .ok_or_else(|| ClusterError::Protocol("empty query result".into()))?;

                let mut members = Vec::with_capacity(rowset.values.len());
                for row in &rowset.values {
                    let text = |i: usize| -> String {
                        row.get(i)
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string()
                    };
                    let addr = text(1);
                    members.push(ClusterMember {
                        leader: leader_addr.as_deref() == Some(addr.as_str()),
                        addr,
                        name: text(0),
                        certificate: text(2),
                    });
                }
                Ok(members)
            }
            Err(err) if err.is_not_leader() => {
                let client = self.leader_client()?;
                client.cluster_members().await
            }
            Err(err) => Err(err),
        }
    }
}

/// Single consumer of the store's observation channel.
///
/// `Shutdown` tears the runtime down; a leader observation refreshes
/// the peer store.  Role changes need no direct action since a leader
/// change always follows, and vote requests are ignored.
pub(crate) async fn observer(state: Weak<AppState>, mut rx: broadcast::Receiver<StoreEvent>) {
    loop {
        match rx.recv().await {
            Ok(StoreEvent::State(RaftRole::Shutdown)) => {
                if let Some(state) = state.upgrade() {
                    state.disable_cluster();
                }
                return;
            }
            Ok(StoreEvent::State(_)) => {}
            Ok(StoreEvent::Leader(_)) => {
                let Some(state) = state.upgrade() else { return };
                // The store can fire a no-leader observation while it is
                // being torn down; the runtime may already be gone.
                let Some(runtime) = state.cluster() else {
                    continue;
                };
                if let Err(err) = runtime.refresh_members().await {
                    error!("error refreshing cluster members: {err}");
                }
            }
            Ok(StoreEvent::Vote) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                error!("observer lagged, skipped {skipped} observations");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

/// Derive the dialable cluster address from the configured bind
/// address.  Wildcard binds cannot be handed to other members.
pub fn cluster_addr(host: &str, port: u16) -> Result<String, ClusterError> {
    let ip: IpAddr = host
        .parse()
        .map_err(|_| ClusterError::BadRequest(format!("unparsable ip {host}")))?;
    if ip.is_unspecified() {
        return Err(ClusterError::BadRequest(format!(
            "cannot use wildcard addr {host} as cluster addr"
        )));
    }
    Ok(format!("{host}:{port}"))
}

/// INSERT statement for a new `cluster_nodes` row.  The engine has no
/// prepared statements, so values are rendered client-side.
pub fn add_member_stmt(addr: &str, name: &str, certificate: &str) -> String {
    format!(
        "INSERT INTO cluster_nodes (addr, name, certificate) VALUES ({}, {}, {})",
        driver::quote_text(addr),
        driver::quote_text(name),
        driver::quote_text(certificate),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_addr_rejects_wildcard() {
        assert!(cluster_addr("0.0.0.0", 8443).is_err());
        assert!(cluster_addr("::", 8443).is_err());
    }

    #[test]
    fn test_cluster_addr_rejects_hostname() {
        assert!(cluster_addr("example.com", 8443).is_err());
    }

    #[test]
    fn test_cluster_addr_formats() {
        assert_eq!(cluster_addr("10.0.0.1", 8443).unwrap(), "10.0.0.1:8443");
    }

    #[test]
    fn test_add_member_stmt_escapes() {
        let stmt = add_member_stmt("10.0.0.1:8443", "o'brien", "CERT");
        assert!(stmt.contains("'o''brien'"));
        assert!(stmt.starts_with("INSERT INTO cluster_nodes"));
    }
}
