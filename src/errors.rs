//! Cluster error types.
//!
//! Every variant maps to a well-known HTTP status.  The enum implements
//! [`axum::response::IntoResponse`] so handlers can simply return
//! `Err(ClusterError::NotInCluster)`.
//!
//! `NotLeader` and `RaftShutdown` are recovered inside the core (the
//! on-leader decorator and the SQL driver shim forward or swallow them);
//! every other variant surfaces to the HTTP boundary with its message
//! preserved in the response body.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Errors produced by the clustered control plane.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The local consensus engine cannot accept a write.
    #[error("not the cluster leader")]
    NotLeader,

    /// The engine is being torn down concurrently with a request.
    #[error("raft is shut down")]
    RaftShutdown,

    /// The peer store has no entry for the given name or address.
    #[error("no such cluster member: {0}")]
    NoSuchMember(String),

    /// A resource (typically an operation) does not exist anywhere in
    /// the cluster.
    #[error("{0}")]
    NotFound(String),

    /// PEM decode or certificate parse failure.
    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),

    /// A statement in an execute batch failed.
    #[error("schema error: {0}")]
    Schema(String),

    /// Network error reaching a forwarding target.
    #[error("forwarding failed: {0}")]
    Forwarding(String),

    /// An endpoint requiring clustering was called while it is disabled.
    #[error("clustering not enabled")]
    NotInCluster,

    /// `POST /1.0/cluster` on a node that is already clustered.
    #[error("clustering already enabled")]
    AlreadyClustered,

    /// Internal protocol violation, e.g. a request that was already
    /// forwarded to the leader and still failed with NotLeader.
    #[error("cluster protocol error: {0}")]
    Protocol(String),

    /// Malformed request body or parameters.
    #[error("{0}")]
    BadRequest(String),

    /// Catch-all for unexpected internal errors.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ClusterError {
    /// Return the appropriate HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            // NotLeader leaking to the boundary means forwarding was not
            // possible; the node cannot currently serve the write.
            ClusterError::NotLeader => StatusCode::SERVICE_UNAVAILABLE,
            ClusterError::RaftShutdown => StatusCode::SERVICE_UNAVAILABLE,
            ClusterError::NoSuchMember(_) => StatusCode::NOT_FOUND,
            ClusterError::NotFound(_) => StatusCode::NOT_FOUND,
            ClusterError::InvalidCertificate(_) => StatusCode::BAD_REQUEST,
            ClusterError::Schema(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ClusterError::Forwarding(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ClusterError::NotInCluster => StatusCode::BAD_REQUEST,
            ClusterError::AlreadyClustered => StatusCode::BAD_REQUEST,
            ClusterError::Protocol(_) => StatusCode::SERVICE_UNAVAILABLE,
            ClusterError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ClusterError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// True for the sentinel meaning "this node is not the leader".
    pub fn is_not_leader(&self) -> bool {
        matches!(self, ClusterError::NotLeader)
    }
}

impl IntoResponse for ClusterError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = serde_json::json!({
            "type": "error",
            "code": status.as_u16(),
            "error": self.to_string(),
        });

        (
            status,
            [("content-type", "application/json")],
            body.to_string(),
        )
            .into_response()
    }
}

impl From<rusqlite::Error> for ClusterError {
    fn from(err: rusqlite::Error) -> Self {
        ClusterError::Schema(err.to_string())
    }
}

impl From<serde_json::Error> for ClusterError {
    fn from(err: serde_json::Error) -> Self {
        ClusterError::BadRequest(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            ClusterError::NoSuchMember("beta".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ClusterError::NotInCluster.status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ClusterError::InvalidCertificate("bad pem".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ClusterError::Schema("syntax error".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ClusterError::Protocol("double forward".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_is_not_leader() {
        assert!(ClusterError::NotLeader.is_not_leader());
        assert!(!ClusterError::RaftShutdown.is_not_leader());
    }

    #[test]
    fn test_message_preserved() {
        let err = ClusterError::NoSuchMember("gamma".into());
        assert_eq!(err.to_string(), "no such cluster member: gamma");
    }
}
