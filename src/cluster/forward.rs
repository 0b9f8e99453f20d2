//! On-leader request decorator.
//!
//! Wraps endpoints that must run on the leader or on a specific peer.
//! The request body is buffered up front so it can be replayed on a
//! forward; `forwardToLeader=true` marks a request that has already
//! been relayed once and must not be forwarded again.
//!
//! Each forwarding hop uses a fresh HTTP client pinned to the
//! destination's server certificate and presenting the local node's
//! own identity.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{request::Parts, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::future::BoxFuture;
use tracing::warn;

use crate::client::ClusterClient;
use crate::cluster::peers::ClusterMember;
use crate::cluster::ClusterRuntime;
use crate::errors::ClusterError;
use crate::AppState;

/// Query-string marker breaking forward loops.  Idempotent: appended at
/// most once, preserved on relay.
pub const FORWARD_TO_LEADER: &str = "forwardToLeader";

/// Resolve the specific member a request targets, if any.
pub type TargetFn = Box<dyn FnOnce() -> Result<Option<ClusterMember>, ClusterError> + Send>;

/// The part of the request that must run on the leader.
pub type LeaderFn =
    Box<dyn FnOnce(Bytes, Option<ClusterMember>) -> BoxFuture<'static, Result<(), ClusterError>> + Send>;

/// The part of the request that runs on the target node itself.
pub type ResponseFn = Box<dyn FnOnce() -> BoxFuture<'static, Response> + Send>;

/// Callback set for one decorated endpoint.
#[derive(Default)]
pub struct OnLeaderHandler {
    pub get_target: Option<TargetFn>,
    pub leader: Option<LeaderFn>,
    pub target: Option<ResponseFn>,
}

impl OnLeaderHandler {
    /// Run the local-or-forward policy for `req`.
    pub async fn handle(self, state: Arc<AppState>, req: axum::extract::Request) -> Response {
        let Some(runtime) = state.cluster() else {
            return ClusterError::NotInCluster.into_response();
        };

        let (parts, body) = req.into_parts();
        let body = match axum::body::to_bytes(body, usize::MAX).await {
            Ok(body) => body,
            Err(err) => return ClusterError::BadRequest(err.to_string()).into_response(),
        };

        let forwarded = has_forward_flag(&parts.uri);

        let target = match self.get_target {
            Some(get_target) => match get_target() {
                Ok(target) => target,
                Err(err) => return err.into_response(),
            },
            None => None,
        };

        // Not the target: relay the whole request there and stream the
        // answer back.
        if !forwarded {
            if let Some(target) = &target {
                if target.addr != runtime.my_addr() {
                    return forward_request(&runtime, target, &parts, body).await;
                }
            }
        }

        if let Some(leader) = self.leader {
            match leader(body.clone(), target).await {
                Ok(()) => {}
                Err(err) if err.is_not_leader() => {
                    if forwarded {
                        // Already relayed once; forwarding again would
                        // loop.
                        warn!(
                            "request {} carried {FORWARD_TO_LEADER} but the node is not leader",
                            parts.uri
                        );
                        return ClusterError::Protocol(
                            "forwarded request reached a non-leader".into(),
                        )
                        .into_response();
                    }
                    let leader_member = match runtime.leader_member() {
                        Ok(member) => member,
                        Err(err) => return err.into_response(),
                    };
                    let resp =
                        forward_to_leader(&runtime, &leader_member, &parts, body).await;
                    if resp.status().as_u16() >= 300 {
                        return resp;
                    }
                    // The leader committed the write; fall through so a
                    // target callback still runs locally.
                }
                Err(ClusterError::RaftShutdown) => {
                    // A concurrent delete/shutdown raced this request;
                    // idempotent success.
                }
                Err(err) => return err.into_response(),
            }
        }

        if forwarded {
            // The forwarding node needs a clean synchronous response to
            // continue, even when the wrapped operation is async.
            return empty_success();
        }

        match self.target {
            Some(target) => target().await,
            None => empty_success(),
        }
    }
}

/// 200 with an empty JSON object.
pub fn empty_success() -> Response {
    (
        StatusCode::OK,
        [("content-type", "application/json")],
        "{}",
    )
        .into_response()
}

/// Whether the loop-breaker flag is present.
pub fn has_forward_flag(uri: &Uri) -> bool {
    uri.query()
        .map(|q| {
            q.split('&')
                .any(|pair| pair == format!("{FORWARD_TO_LEADER}=true"))
        })
        .unwrap_or(false)
}

/// Append a query parameter to a path, keeping any existing query.
pub fn append_query_param(path_and_query: &str, key: &str, value: &str) -> String {
    let sep = if path_and_query.contains('?') { '&' } else { '?' };
    format!("{path_and_query}{sep}{key}={value}")
}

/// Relay a buffered request to `member` verbatim.
pub async fn forward_request(
    runtime: &ClusterRuntime,
    member: &ClusterMember,
    parts: &Parts,
    body: Bytes,
) -> Response {
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| parts.uri.path().to_string());

    relay(runtime, member, parts.method.clone(), &path, body).await
}

/// Relay a buffered request to the leader, marked with the
/// loop-breaker flag.
async fn forward_to_leader(
    runtime: &ClusterRuntime,
    leader: &ClusterMember,
    parts: &Parts,
    body: Bytes,
) -> Response {
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| parts.uri.path().to_string());
    let path = if has_forward_flag(&parts.uri) {
        path
    } else {
        append_query_param(&path, FORWARD_TO_LEADER, "true")
    };

    relay(runtime, leader, parts.method.clone(), &path, body).await
}

async fn relay(
    runtime: &ClusterRuntime,
    member: &ClusterMember,
    method: Method,
    path_and_query: &str,
    body: Bytes,
) -> Response {
    let client = match ClusterClient::connect_to(
        member,
        runtime.identity(),
        runtime.request_timeout(),
    ) {
        Ok(client) => client,
        Err(err) => return err.into_response(),
    };

    match client.forward(method, path_and_query, body).await {
        Ok(resp) => relay_response(resp),
        Err(err) => err.into_response(),
    }
}

/// Stream a remote response back to our caller, preserving status and
/// content type.
pub fn relay_response(resp: reqwest::Response) -> Response {
    let status = resp.status();
    let content_type = resp
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json")
        .to_string();

    Response::builder()
        .status(status)
        .header("content-type", content_type)
        .body(Body::from_stream(resp.bytes_stream()))
        .unwrap_or_else(|err| {
            ClusterError::Forwarding(err.to_string()).into_response()
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_query_param() {
        assert_eq!(
            append_query_param("/1.0/cluster/nodes", FORWARD_TO_LEADER, "true"),
            "/1.0/cluster/nodes?forwardToLeader=true"
        );
        assert_eq!(
            append_query_param("/1.0/operations/x?timeout=5", FORWARD_TO_LEADER, "true"),
            "/1.0/operations/x?timeout=5&forwardToLeader=true"
        );
    }

    #[test]
    fn test_has_forward_flag() {
        let with: Uri = "/1.0/cluster/nodes?forwardToLeader=true".parse().unwrap();
        let without: Uri = "/1.0/cluster/nodes".parse().unwrap();
        let other: Uri = "/1.0/cluster/nodes?forwardToLeader=false".parse().unwrap();
        assert!(has_forward_flag(&with));
        assert!(!has_forward_flag(&without));
        assert!(!has_forward_flag(&other));
    }

    /// The flag is appended at most once.
    #[test]
    fn test_forward_flag_idempotent() {
        let path = append_query_param("/x", FORWARD_TO_LEADER, "true");
        let uri: Uri = path.parse().unwrap();
        assert!(has_forward_flag(&uri));
        // A second pass would detect the flag instead of re-appending.
        assert_eq!(path.matches(FORWARD_TO_LEADER).count(), 1);
    }
}
