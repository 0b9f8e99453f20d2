//! Prometheus metrics for corral.
//!
//! Installs a global Prometheus recorder using `metrics-exporter-prometheus`,
//! defines metric name constants, and exposes the `/metrics` endpoint
//! handler.

use axum::response::IntoResponse;
use metrics::describe_counter;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

// -- Metric name constants ----------------------------------------------------

/// Requests relayed to another cluster member (counter).
pub const FORWARDED_REQUESTS_TOTAL: &str = "corral_forwarded_requests_total";

/// Consensus frames read from peers (counter).
pub const RAFT_FRAMES_IN_TOTAL: &str = "corral_raft_frames_in_total";

/// Consensus frames written to peers (counter).
pub const RAFT_FRAMES_OUT_TOTAL: &str = "corral_raft_frames_out_total";

/// Statement batches proposed through the log (counter).
pub const RAFT_PROPOSALS_TOTAL: &str = "corral_raft_proposals_total";

/// Operations started (counter).
pub const OPERATIONS_STARTED_TOTAL: &str = "corral_operations_started_total";

// -- Global recorder installation ---------------------------------------------

/// Singleton handle to the Prometheus recorder.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus metrics recorder. Idempotent -- safe to call
/// multiple times (e.g. in tests). Returns a reference to the global handle.
pub fn init_metrics() -> &'static PrometheusHandle {
    PROMETHEUS_HANDLE.get_or_init(|| {
        PrometheusBuilder::new()
            .install_recorder()
            .expect("failed to install Prometheus recorder")
    })
}

/// Register metric descriptions with the global recorder. Call once after
/// `init_metrics()`.
pub fn describe_metrics() {
    describe_counter!(
        FORWARDED_REQUESTS_TOTAL,
        "Requests relayed to another cluster member"
    );
    describe_counter!(RAFT_FRAMES_IN_TOTAL, "Consensus frames read from peers");
    describe_counter!(RAFT_FRAMES_OUT_TOTAL, "Consensus frames written to peers");
    describe_counter!(
        RAFT_PROPOSALS_TOTAL,
        "Statement batches proposed through the log"
    );
    describe_counter!(OPERATIONS_STARTED_TOTAL, "Operations started");
}

// -- Metrics endpoint ---------------------------------------------------------

/// `GET /metrics` -- render the Prometheus exposition format.
pub async fn metrics_handler() -> impl IntoResponse {
    let handle = init_metrics();
    handle.render()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics_idempotent() {
        let a = init_metrics() as *const _;
        let b = init_metrics() as *const _;
        assert_eq!(a, b);
        describe_metrics();
    }
}
