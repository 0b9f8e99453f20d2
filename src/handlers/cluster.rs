//! Cluster API endpoints.
//!
//! Bootstrap (`POST /1.0/cluster`), membership management
//! (`/1.0/cluster/nodes...`), the raw replicated-DB surface
//! (`/1.0/cluster/db`) and the raft transport upgrade
//! (`GET /internal/raft/connect`).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Extension, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::cluster::driver::render;
use crate::cluster::forward::{empty_success, OnLeaderHandler};
use crate::cluster::peers::{ClusterMember, MemberList};
use crate::cluster::store::Consistency;
use crate::cluster::ws::{WsByteStream, WsSocket};
use crate::cluster::{add_member_stmt, CURRENT_SCHEMA, ENABLE_FOREIGN_KEYS};
use crate::errors::ClusterError;
use crate::tls::{parse_cert_chain, PeerCertificate};
use crate::AppState;

/// How long the bootstrap leader waits for its own election.
const BOOTSTRAP_LEADER_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a join is given to converge before the add is rolled back.
const JOIN_TIMEOUT: Duration = Duration::from_secs(100);

// -- /1.0/cluster -------------------------------------------------------------

/// `GET /1.0/cluster` -- clustering state of this node.
pub async fn cluster_get(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let mode = if state.cluster_enabled() { "OK" } else { "DISABLED" };
    Json(serde_json::json!({
        "state": mode,
        "keys": [],
    }))
}

#[derive(Debug, Deserialize)]
pub struct ClusterPostRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub leader: bool,
}

/// `POST /1.0/cluster` -- enable clustering, as the bootstrap leader or
/// as a follower waiting to be joined.
pub async fn cluster_post(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ClusterPostRequest>,
) -> Result<Response, ClusterError> {
    let runtime = state.enable_cluster(req.leader)?;

    if !req.leader {
        // A follower just waits for the leader's coming
        // `POST /1.0/cluster/nodes` to join it.
        return Ok(empty_success());
    }

    if req.name.is_empty() {
        state.disable_cluster();
        return Err(ClusterError::BadRequest(
            "must supply a name to the cluster leader".into(),
        ));
    }

    let bootstrap = async {
        runtime.store.wait_for_leader(BOOTSTRAP_LEADER_TIMEOUT).await?;

        // The row order matters downstream: the schema must exist
        // before the self-row lands in it.
        let mut stmts = vec![ENABLE_FOREIGN_KEYS.to_string()];
        stmts.extend(CURRENT_SCHEMA.iter().map(|s| s.to_string()));
        stmts.push(add_member_stmt(
            runtime.my_addr(),
            &req.name,
            &state.identity.cert_pem,
        ));

        let results = runtime.store.execute(stmts, false).await?;
        for result in &results {
            if let Some(message) = &result.error {
                return Err(ClusterError::Schema(message.clone()));
            }
        }

        runtime.refresh_members().await?;
        Ok(())
    };

    match bootstrap.await {
        Ok(()) => {
            info!("clustering enabled, leader {}", req.name);
            Ok(empty_success())
        }
        Err(err) => {
            state.disable_cluster();
            Err(err)
        }
    }
}

// -- /1.0/cluster/nodes -------------------------------------------------------

/// `GET /1.0/cluster/nodes` -- the current member list.
pub async fn cluster_nodes_get(
    State(state): State<Arc<AppState>>,
) -> Result<Json<MemberList>, ClusterError> {
    let runtime = state.cluster().ok_or(ClusterError::NotInCluster)?;
    Ok(Json(MemberList {
        members: runtime.peers.members(),
    }))
}

/// `POST /1.0/cluster/nodes` (on-leader) -- add a member.
pub async fn cluster_nodes_post(
    State(state): State<Arc<AppState>>,
    req: axum::extract::Request,
) -> Response {
    let leader_state = state.clone();
    OnLeaderHandler {
        get_target: None,
        leader: Some(Box::new(move |body, _target| {
            Box::pin(async move {
                let member: ClusterMember = serde_json::from_slice(&body)?;
                add_member(&leader_state, member).await
            })
        })),
        target: None,
    }
    .handle(state, req)
    .await
}

/// The leader-side half of adding a member.  Ordering is what makes
/// this safe: the `cluster_nodes` row must exist before `join`, so a
/// leader elected mid-join already sees the new member; failures roll
/// back in reverse.
async fn add_member(state: &Arc<AppState>, member: ClusterMember) -> Result<(), ClusterError> {
    let runtime = state.cluster().ok_or(ClusterError::NotInCluster)?;

    parse_cert_chain(&member.certificate)?;

    let results = runtime
        .store
        .execute(
            vec![add_member_stmt(
                &member.addr,
                &member.name,
                &member.certificate,
            )],
            true,
        )
        .await?;
    for result in &results {
        if let Some(message) = &result.error {
            return Err(ClusterError::Schema(message.clone()));
        }
    }

    // Remember the certificate ourselves so the transport can dial the
    // new member before the next refresh.
    runtime
        .peers
        .add_peer(member.clone())
        .map_err(ClusterError::Internal)?;

    if let Err(join_err) = runtime.store.join(&member.addr).await {
        // Un-adjust the member list, then drop the row.
        if let Err(err) = runtime.peers.remove_by_addr(&member.addr) {
            error!("error adjusting to old members: {err}");
        }
        let delete = render(
            "DELETE FROM cluster_nodes WHERE name = ?",
            &[member.name.clone().into()],
        )?;
        if let Err(err) = runtime.store.execute(vec![delete], true).await {
            return Err(ClusterError::Protocol(format!(
                "error deleting node from cluster on failed join: {err}: {join_err}"
            )));
        }
        return Err(join_err);
    }

    runtime.store.wait_for_leader(JOIN_TIMEOUT).await?;
    info!("cluster member {} added at {}", member.name, member.addr);
    Ok(())
}

/// `GET /1.0/cluster/nodes/{name}` -- one member, rendered.
pub async fn cluster_node_get(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<ClusterMember>, ClusterError> {
    let runtime = state.cluster().ok_or(ClusterError::NotInCluster)?;
    Ok(Json(runtime.peers.member_by_name(&name)?))
}

#[derive(Debug, Deserialize)]
struct RenameRequest {
    name: String,
}

/// `POST /1.0/cluster/nodes/{name}` (on-leader) -- rename a member.
pub async fn cluster_node_post(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    req: axum::extract::Request,
) -> Response {
    let leader_state = state.clone();
    OnLeaderHandler {
        get_target: None,
        leader: Some(Box::new(move |body, _target| {
            Box::pin(async move {
                let runtime = leader_state.cluster().ok_or(ClusterError::NotInCluster)?;
                let rename: RenameRequest = serde_json::from_slice(&body)?;
                let stmt = render(
                    "UPDATE cluster_nodes SET name = ? WHERE name = ?",
                    &[rename.name.into(), name.into()],
                )?;
                runtime.cluster_db_execute(&stmt).await?;
                Ok(())
            })
        })),
        target: None,
    }
    .handle(state, req)
    .await
}

/// `DELETE /1.0/cluster/nodes/{name}` (on-leader, targeted) -- remove a
/// member.  The leader drops the row and retires the voter; the member
/// itself stops its engine and wipes its consensus state.
pub async fn cluster_node_delete(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    req: axum::extract::Request,
) -> Response {
    let target_state = state.clone();
    let leader_state = state.clone();
    let self_state = state.clone();
    let target_name = name.clone();

    OnLeaderHandler {
        get_target: Some(Box::new(move || {
            let runtime = target_state
                .cluster()
                .ok_or(ClusterError::NotInCluster)?;
            Ok(Some(runtime.peers.member_by_name(&target_name)?))
        })),
        leader: Some(Box::new(move |_body, target| {
            Box::pin(async move {
                let runtime = leader_state.cluster().ok_or(ClusterError::NotInCluster)?;
                let member = match target {
                    Some(member) => member,
                    None => runtime.peers.member_by_name(&name)?,
                };

                let delete = render(
                    "DELETE FROM cluster_nodes WHERE name = ?",
                    &[member.name.clone().into()],
                )?;
                match runtime.store.execute(vec![delete], true).await {
                    Ok(results) => {
                        for result in &results {
                            if let Some(message) = &result.error {
                                error!(
                                    "failed removing {} from cluster members: {message}",
                                    member.name
                                );
                            }
                        }
                    }
                    Err(err) if err.is_not_leader() => return Err(err),
                    Err(err) => {
                        error!("failed removing {} from cluster members: {err}", member.name)
                    }
                }

                runtime.store.remove(&member.addr).await
            })
        })),
        target: Some(Box::new(move || {
            Box::pin(async move {
                info!("leaving cluster");
                self_state.disable_cluster();
                empty_success()
            })
        })),
    }
    .handle(state, req)
    .await
}

// -- /1.0/cluster/db ----------------------------------------------------------

/// `GET /1.0/cluster/db` -- with `?q=`, one weak-consistency rowset;
/// without, the SQL dump as a file response.
pub async fn cluster_db_get(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, ClusterError> {
    let runtime = state.cluster().ok_or(ClusterError::NotInCluster)?;

    if let Some(q) = params.get("q") {
        let mut rows = runtime
            .store
            .query(vec![q.clone()], Consistency::Weak)
            .await?;
        if rows.len() != 1 {
            return Err(ClusterError::Protocol(format!(
                "wrong number of rowsets, got {}",
                rows.len()
            )));
        }
        return Ok(Json(rows.remove(0)).into_response());
    }

    let dump = runtime.store.database().await?;
    Ok((
        StatusCode::OK,
        [
            ("content-type", "application/sql; charset=utf-8"),
            ("content-disposition", "attachment; filename=\"dump.sql\""),
        ],
        dump,
    )
        .into_response())
}

/// `POST /1.0/cluster/db` -- execute one statement through the store.
pub async fn cluster_db_post(
    State(state): State<Arc<AppState>>,
    Json(stmt): Json<String>,
) -> Result<Response, ClusterError> {
    let runtime = state.cluster().ok_or(ClusterError::NotInCluster)?;

    let mut results = runtime.store.execute(vec![stmt], false).await?;
    if results.len() != 1 {
        return Err(ClusterError::Protocol(format!(
            "unexpected number of results {}",
            results.len()
        )));
    }
    Ok(Json(results.remove(0)).into_response())
}

// -- /internal/raft/connect ---------------------------------------------------

/// `GET /internal/raft/connect` -- authenticated websocket upgrade
/// feeding the transport's inbound queue.
///
/// The caller's TLS client certificate is required; the first one seen
/// is kept as the one-shot leader certificate for the fresh-follower
/// callback.
pub async fn raft_connect(
    State(state): State<Arc<AppState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    peer_cert: Option<Extension<PeerCertificate>>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(runtime) = state.cluster() else {
        return ClusterError::NotInCluster.into_response();
    };

    let Some(Extension(cert)) = peer_cert else {
        return ClusterError::BadRequest("no client certificate provided".into())
            .into_response();
    };

    if !runtime.transport.has_capacity() {
        warn!("rejecting raft connection from {remote}: inbound queue full");
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    runtime.peers.set_first_leader_cert(cert);

    ws.on_upgrade(move |socket| async move {
        let conn = WsByteStream::new(
            WsSocket::Server(socket),
            runtime.transport.my_addr().to_string(),
            remote.to_string(),
        );
        if let Err(err) = runtime.transport.handoff(conn) {
            warn!("dropping raft connection from {remote}: {err}");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::driver::Value;

    #[test]
    fn test_cluster_post_request_defaults() {
        let req: ClusterPostRequest = serde_json::from_str("{}").unwrap();
        assert!(!req.leader);
        assert!(req.name.is_empty());

        let req: ClusterPostRequest =
            serde_json::from_str(r#"{"name": "alpha", "leader": true}"#).unwrap();
        assert!(req.leader);
        assert_eq!(req.name, "alpha");
    }

    #[test]
    fn test_rename_statement_renders() {
        let stmt = render(
            "UPDATE cluster_nodes SET name = ? WHERE name = ?",
            &[Value::Text("new".into()), Value::Text("old".into())],
        )
        .unwrap();
        assert_eq!(
            stmt,
            "UPDATE cluster_nodes SET name = 'new' WHERE name = 'old'"
        );
    }
}
