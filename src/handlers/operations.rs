//! Operation API endpoints.
//!
//! An operation lives on the node that created it; every other node can
//! still serve requests for it by looking the owner up in the
//! replicated `operations` index and forwarding there.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;

use crate::cluster::driver::ClusterDb;
use crate::cluster::forward::{empty_success, forward_request};
use crate::errors::ClusterError;
use crate::operations::Operation;
use crate::AppState;

/// Local lookup, falling back to the replicated index and a forward to
/// the owning node.
enum FoundOp {
    Local(Arc<Operation>),
    Forwarded(Response),
}

async fn find_or_forward(
    state: &Arc<AppState>,
    id: &str,
    parts: &axum::http::request::Parts,
) -> Result<FoundOp, ClusterError> {
    if let Some(op) = state.operations.get(id) {
        return Ok(FoundOp::Local(op));
    }

    let Some(runtime) = state.cluster() else {
        return Err(ClusterError::NotFound(format!(
            "operation '{id}' doesn't exist"
        )));
    };

    let db = ClusterDb::new(runtime.clone());
    let rows = db
        .query(
            "SELECT addr FROM cluster_nodes JOIN operations \
             ON operations.cluster_id = cluster_nodes.id WHERE uuid = ?",
            &[id.to_string().into()],
        )
        .await?;

    let addr = rows
        .values
        .first()
        .and_then(|row| row.first())
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let Some(addr) = addr else {
        return Err(ClusterError::NotFound(format!(
            "operation '{id}' doesn't exist"
        )));
    };

    let member = runtime.peers.member_by_addr(&addr)?;
    Ok(FoundOp::Forwarded(
        forward_request(&runtime, &member, parts, Bytes::new()).await,
    ))
}

/// `GET /1.0/operations` -- operations bucketed by status;
/// `?recursion=1` expands each to its full rendering.
pub async fn operations_get(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<serde_json::Value> {
    let recursion = params.get("recursion").is_some_and(|v| v == "1");

    let mut buckets: HashMap<String, Vec<serde_json::Value>> = HashMap::new();
    for op in state.operations.all() {
        let status = op.status().as_str().to_string();
        let entry = if recursion {
            serde_json::to_value(op.render()).unwrap_or_default()
        } else {
            serde_json::Value::from(op.url().to_string())
        };
        buckets.entry(status).or_default().push(entry);
    }

    Json(serde_json::to_value(buckets).unwrap_or_default())
}

/// `GET /1.0/operations/{id}` -- render one operation, wherever it
/// lives.
pub async fn operation_get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    req: axum::extract::Request,
) -> Response {
    let (parts, _body) = req.into_parts();
    match find_or_forward(&state, &id, &parts).await {
        Ok(FoundOp::Local(op)) => Json(op.render()).into_response(),
        Ok(FoundOp::Forwarded(resp)) => resp,
        Err(err) => err.into_response(),
    }
}

/// `DELETE /1.0/operations/{id}` -- cancel, wherever it lives.
pub async fn operation_delete(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    req: axum::extract::Request,
) -> Response {
    let (parts, _body) = req.into_parts();
    match find_or_forward(&state, &id, &parts).await {
        Ok(FoundOp::Local(op)) => match op.cancel() {
            Ok(()) => empty_success(),
            Err(err) => err.into_response(),
        },
        Ok(FoundOp::Forwarded(resp)) => resp,
        Err(err) => err.into_response(),
    }
}

/// `GET /1.0/operations/{id}/wait?timeout=` -- block until the
/// operation is final or the timeout (seconds, -1 = indefinitely)
/// fires, then render it.
pub async fn operation_wait_get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    req: axum::extract::Request,
) -> Response {
    let timeout = match params.get("timeout").map(|t| t.parse::<i64>()) {
        None => -1,
        Some(Ok(timeout)) => timeout,
        Some(Err(err)) => {
            return ClusterError::BadRequest(format!("invalid timeout: {err}")).into_response()
        }
    };

    let (parts, _body) = req.into_parts();
    match find_or_forward(&state, &id, &parts).await {
        Ok(FoundOp::Local(op)) => {
            let timeout = (timeout >= 0).then(|| Duration::from_secs(timeout as u64));
            op.wait_final(timeout).await;
            Json(op.render()).into_response()
        }
        Ok(FoundOp::Forwarded(resp)) => resp,
        Err(err) => err.into_response(),
    }
}

/// `GET /1.0/operations/{id}/websocket` -- hand the connection to the
/// operation's connect hook.
pub async fn operation_websocket_get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
    req: axum::extract::Request,
) -> Response {
    let (parts, _body) = req.into_parts();
    match find_or_forward(&state, &id, &parts).await {
        Ok(FoundOp::Local(op)) => match op.connect(ws) {
            Ok(resp) => resp,
            Err(err) => err.into_response(),
        },
        Ok(FoundOp::Forwarded(resp)) => resp,
        Err(err) => err.into_response(),
    }
}
