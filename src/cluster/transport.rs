//! Raft transport: inbound listener + outbound dialer.
//!
//! The consensus engine consumes connections from two directions.
//! Inbound, the HTTP layer upgrades `GET /internal/raft/connect` and
//! hands the websocket over through a bounded queue; when the queue is
//! full the upgrade is rejected.  Outbound, `dial` resolves the member
//! behind an address, builds a TLS client config pinned to that member's
//! certificate, and connects to its raft-connect endpoint.
//!
//! There is at most one live transport per process; its presence is the
//! cluster-mode flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio_tungstenite::{connect_async_tls_with_config, Connector};
use tracing::debug;

use crate::cluster::peers::PeerStore;
use crate::cluster::ws::{WsByteStream, WsSocket};
use crate::tls::{pinned_client_config, TlsIdentity};

/// Capacity of the inbound connection queue.
const INBOUND_QUEUE: usize = 10;

/// Listener/dialer pair carrying consensus traffic over mutual-TLS
/// websockets.
pub struct RaftTransport {
    my_addr: String,
    identity: TlsIdentity,
    peers: Arc<PeerStore>,
    inbound_tx: mpsc::Sender<WsByteStream>,
    inbound_rx: Mutex<mpsc::Receiver<WsByteStream>>,
    stopped: AtomicBool,
    stop: Notify,
}

impl RaftTransport {
    /// Create a transport bound to the local cluster address.
    pub fn new(my_addr: String, identity: TlsIdentity, peers: Arc<PeerStore>) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        Self {
            my_addr,
            identity,
            peers,
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            stopped: AtomicBool::new(false),
            stop: Notify::new(),
        }
    }

    /// The local cluster address, as `host:port`.
    pub fn my_addr(&self) -> &str {
        &self.my_addr
    }

    /// Block until the next inbound connection, or return a disconnected
    /// error once the transport is closed.
    pub async fn accept(&self) -> anyhow::Result<WsByteStream> {
        if self.stopped.load(Ordering::SeqCst) {
            anyhow::bail!("transport disconnected");
        }

        let mut rx = self.inbound_rx.lock().await;
        tokio::select! {
            _ = self.stop.notified() => anyhow::bail!("transport disconnected"),
            next = rx.recv() => next.context("transport disconnected"),
        }
    }

    /// Signal stop.  Idempotent.
    pub fn close(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.stop.notify_waiters();
    }

    /// Whether the inbound queue can take another connection.  The
    /// HTTP layer checks this before committing to an upgrade.
    pub fn has_capacity(&self) -> bool {
        !self.stopped.load(Ordering::SeqCst) && self.inbound_tx.capacity() > 0
    }

    /// Queue a connection produced by the HTTP layer's upgrade.  Fails
    /// when the queue is full or the transport is closed, in which case
    /// the caller rejects the upgrade.
    pub fn handoff(&self, conn: WsByteStream) -> anyhow::Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            anyhow::bail!("transport disconnected");
        }
        self.inbound_tx
            .try_send(conn)
            .map_err(|_| anyhow::anyhow!("inbound raft queue full"))
    }

    /// Dial the raft-connect endpoint of the member behind `addr`,
    /// pinning its certificate as the expected server certificate.
    pub async fn dial(&self, addr: &str, timeout: Duration) -> anyhow::Result<WsByteStream> {
        let member = self.peers.member_by_addr(addr)?;
        let config = pinned_client_config(&self.identity, &member.certificate)?;

        let url = format!("wss://{addr}/internal/raft/connect");
        debug!("dialing raft peer {addr}");

        let (stream, _resp) = tokio::time::timeout(
            timeout,
            connect_async_tls_with_config(
                url,
                None,
                false,
                Some(Connector::Rustls(Arc::new(config))),
            ),
        )
        .await
        .with_context(|| format!("timed out dialing {addr}"))?
        .with_context(|| format!("websocket dial to {addr} failed"))?;

        Ok(WsByteStream::new(
            WsSocket::Client(stream),
            self.my_addr.clone(),
            addr.to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn transport() -> (TempDir, RaftTransport) {
        let dir = TempDir::new().unwrap();
        let peers = Arc::new(PeerStore::open(dir.path()).unwrap());
        let identity = TlsIdentity {
            cert_pem: String::new(),
            key_pem: String::new(),
        };
        let t = RaftTransport::new("10.0.0.1:8443".into(), identity, peers);
        (dir, t)
    }

    #[tokio::test]
    async fn test_accept_after_close_disconnects() {
        let (_dir, t) = transport();
        t.close();
        t.close(); // idempotent
        assert!(t.accept().await.is_err());
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_accept() {
        let (_dir, t) = transport();
        let t = Arc::new(t);

        let waiter = {
            let t = t.clone();
            tokio::spawn(async move { t.accept().await.is_err() })
        };

        tokio::task::yield_now().await;
        t.close();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_dial_unknown_member() {
        let (_dir, t) = transport();
        let err = t
            .dial("10.9.9.9:8443", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no such cluster member"));
    }
}
