//! corral library -- container management daemon, clustered control plane.
//!
//! This crate provides the clustering core of the daemon: the
//! replicated SQL store and its consensus engine, the mutual-TLS
//! websocket transport, the out-of-band peer store, request forwarding,
//! the long-running operation registry, and the cluster HTTP API.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::cluster::ClusterRuntime;
use crate::config::Config;
use crate::errors::ClusterError;
use crate::events::EventBus;
use crate::operations::OperationRegistry;
use crate::tls::TlsIdentity;

pub mod client;
pub mod cluster;
pub mod config;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod metrics;
pub mod operations;
pub mod server;
pub mod tls;

/// Shared application state passed to all handlers via `axum::extract::State`.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// The local TLS identity (`server.crt` / `server.key`).
    pub identity: TlsIdentity,
    /// The live cluster runtime; `None` means clustering is disabled.
    pub cluster: RwLock<Option<Arc<ClusterRuntime>>>,
    /// Long-running operation registry.
    pub operations: OperationRegistry,
    /// Internal long-poll event bus.
    pub events: EventBus,
}

impl AppState {
    pub fn new(config: Config, identity: TlsIdentity) -> Self {
        Self {
            config,
            identity,
            cluster: RwLock::new(None),
            operations: OperationRegistry::new(),
            events: EventBus::new(),
        }
    }

    /// The live cluster runtime, when clustering is enabled.
    pub fn cluster(&self) -> Option<Arc<ClusterRuntime>> {
        self.cluster.read().expect("cluster lock poisoned").clone()
    }

    /// Whether this daemon is part of a cluster.
    pub fn cluster_enabled(&self) -> bool {
        self.cluster().is_some()
    }

    /// Bring up clustering and its observer loop.  Fails when already
    /// enabled or when the bind address cannot serve as a cluster
    /// address.
    pub fn enable_cluster(
        self: &Arc<Self>,
        leader: bool,
    ) -> Result<Arc<ClusterRuntime>, ClusterError> {
        let mut slot = self.cluster.write().expect("cluster lock poisoned");
        if slot.is_some() {
            return Err(ClusterError::AlreadyClustered);
        }

        let my_addr =
            cluster::cluster_addr(&self.config.server.host, self.config.server.port)?;
        let runtime = ClusterRuntime::start(
            my_addr,
            leader,
            self.identity.clone(),
            self.config.cluster.raft_dir(),
            Duration::from_secs(self.config.server.request_timeout),
        )
        .map_err(ClusterError::Internal)?;

        let observations = runtime.store.register_observer();
        tokio::spawn(cluster::observer(Arc::downgrade(self), observations));

        *slot = Some(runtime.clone());
        Ok(runtime)
    }

    /// Tear clustering down: stop the store, close the transport,
    /// remove the consensus state directory.  Idempotent.
    pub fn disable_cluster(&self) {
        let runtime = self
            .cluster
            .write()
            .expect("cluster lock poisoned")
            .take();
        if let Some(runtime) = runtime {
            runtime.teardown();
        }
    }

    /// Process-exit path: stop the engine and the transport but keep
    /// the consensus state and the peer-store snapshot, which are what
    /// lets the node rejoin its cluster on the next start.  Idempotent.
    pub fn shutdown(&self) {
        let runtime = self
            .cluster
            .write()
            .expect("cluster lock poisoned")
            .take();
        if let Some(runtime) = runtime {
            runtime.stop();
        }
    }
}
