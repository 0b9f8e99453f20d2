//! Axum router construction and route mapping.
//!
//! The [`app`] function wires every control-plane endpoint to its
//! handler and returns a ready-to-serve [`axum::Router`].  The router
//! must be served with connect info so the raft-connect upgrade can
//! record the remote address.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use std::sync::Arc;

use crate::handlers::{cluster, events, operations};
use crate::metrics::metrics_handler;
use crate::AppState;

/// Build the axum [`Router`] with all control-plane routes.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        // Health check endpoint.
        .route("/health", get(health_check))
        // Prometheus metrics endpoint.
        .route("/metrics", get(metrics_handler))
        // Cluster lifecycle and membership.
        .route(
            "/1.0/cluster",
            get(cluster::cluster_get).post(cluster::cluster_post),
        )
        .route(
            "/1.0/cluster/nodes",
            get(cluster::cluster_nodes_get).post(cluster::cluster_nodes_post),
        )
        .route(
            "/1.0/cluster/nodes/:name",
            get(cluster::cluster_node_get)
                .post(cluster::cluster_node_post)
                .delete(cluster::cluster_node_delete),
        )
        // Raw replicated-DB surface.
        .route(
            "/1.0/cluster/db",
            get(cluster::cluster_db_get).post(cluster::cluster_db_post),
        )
        // Raft transport upgrade, driven by the HTTP layer.
        .route("/internal/raft/connect", get(cluster::raft_connect))
        // Long-running operations.
        .route("/1.0/operations", get(operations::operations_get))
        .route(
            "/1.0/operations/:id",
            get(operations::operation_get).delete(operations::operation_delete),
        )
        .route(
            "/1.0/operations/:id/wait",
            get(operations::operation_wait_get),
        )
        .route(
            "/1.0/operations/:id/websocket",
            get(operations::operation_websocket_get),
        )
        // Server event stream.
        .route("/1.0/events", get(events::events_get))
        .with_state(state)
}

/// `GET /health` -- Returns `{"status": "ok"}` with 200 OK.
async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "application/json")],
        r#"{"status":"ok"}"#,
    )
}
