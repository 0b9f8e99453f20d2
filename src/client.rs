//! HTTP client for calling other cluster members.
//!
//! A fresh client is built per hop, keyed by the destination address
//! and its server certificate: the connection pins that certificate
//! and presents the local node's own identity, since every node is
//! both a server and a client.

use std::time::Duration;

use axum::http::Method;
use bytes::Bytes;

use crate::cluster::peers::{ClusterMember, MemberList};
use crate::cluster::store::{ExecResult, Rows};
use crate::errors::ClusterError;
use crate::metrics::FORWARDED_REQUESTS_TOTAL;
use crate::tls::{pinned_client_config, TlsIdentity};

/// Client bound to one remote member.
pub struct ClusterClient {
    base_url: String,
    http: reqwest::Client,
}

impl ClusterClient {
    /// Build a client for `addr`, trusting exactly `server_cert_pem`
    /// and authenticating with the local identity.
    pub fn connect(
        addr: &str,
        server_cert_pem: &str,
        identity: &TlsIdentity,
        timeout: Duration,
    ) -> Result<Self, ClusterError> {
        let tls = pinned_client_config(identity, server_cert_pem)?;
        let http = reqwest::Client::builder()
            .use_preconfigured_tls(tls)
            .timeout(timeout)
            .build()
            .map_err(|err| ClusterError::Forwarding(err.to_string()))?;

        Ok(Self {
            base_url: format!("https://{addr}"),
            http,
        })
    }

    /// Convenience constructor for a known member.
    pub fn connect_to(
        member: &ClusterMember,
        identity: &TlsIdentity,
        timeout: Duration,
    ) -> Result<Self, ClusterError> {
        Self::connect(&member.addr, &member.certificate, identity, timeout)
    }

    /// `GET /1.0/cluster/db?q=` on the remote: one weak-consistency
    /// rowset.
    pub async fn cluster_db_query(&self, sql: &str) -> Result<Rows, ClusterError> {
        let resp = self
            .http
            .get(format!("{}/1.0/cluster/db", self.base_url))
            .query(&[("q", sql)])
            .send()
            .await
            .map_err(|err| ClusterError::Forwarding(err.to_string()))?;

        parse_json(resp).await
    }

    /// `POST /1.0/cluster/db` on the remote: execute one statement.
    pub async fn cluster_db_execute(&self, sql: &str) -> Result<ExecResult, ClusterError> {
        let resp = self
            .http
            .post(format!("{}/1.0/cluster/db", self.base_url))
            .json(&sql)
            .send()
            .await
            .map_err(|err| ClusterError::Forwarding(err.to_string()))?;

        parse_json(resp).await
    }

    /// `GET /1.0/cluster/nodes` on the remote: the member list as the
    /// remote sees it.
    pub async fn cluster_members(&self) -> Result<Vec<ClusterMember>, ClusterError> {
        let resp = self
            .http
            .get(format!("{}/1.0/cluster/nodes", self.base_url))
            .send()
            .await
            .map_err(|err| ClusterError::Forwarding(err.to_string()))?;

        let list: MemberList = parse_json(resp).await?;
        Ok(list.members)
    }

    /// Relay a buffered request to the remote, returning the raw
    /// response for the caller to stream back.
    pub async fn forward(
        &self,
        method: Method,
        path_and_query: &str,
        body: Bytes,
    ) -> Result<reqwest::Response, ClusterError> {
        metrics::counter!(FORWARDED_REQUESTS_TOTAL).increment(1);
        self.http
            .request(method, format!("{}{}", self.base_url, path_and_query))
            .body(body)
            .send()
            .await
            .map_err(|err| ClusterError::Forwarding(err.to_string()))
    }
}

/// Fail non-2xx responses with the remote's message, decode the rest.
async fn parse_json<T: serde::de::DeserializeOwned>(
    resp: reqwest::Response,
) -> Result<T, ClusterError> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(ClusterError::Forwarding(format!(
            "remote returned {status}: {body}"
        )));
    }
    resp.json()
        .await
        .map_err(|err| ClusterError::Forwarding(err.to_string()))
}
