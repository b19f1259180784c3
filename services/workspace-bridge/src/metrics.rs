//! Prometheus metrics exposition
//!
//! Metrics recorded across the bridge:
//!
//! - `workspace_api_requests_total` (counter): labels `service`, `endpoint`, `outcome`
//! - `workspace_api_request_duration_seconds` (histogram): label `service`
//! - `workspace_api_retries_total` (counter): label `service`
//! - `workspace_api_rate_limited_total` (counter): label `service`
//! - `workspace_auth_flows_total` (counter): label `outcome`
//! - `workspace_auth_refresh_total` (counter): label `outcome`
//! - `workspace_bridge_tool_calls_total` (counter): labels `tool`, `outcome`

use axum::Router;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

const DURATION_BUCKETS: &[f64] = &[
    0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new().set_buckets_for_metric(
        Matcher::Full("workspace_api_request_duration_seconds".to_string()),
        DURATION_BUCKETS,
    )
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// `workspace_api_request_duration_seconds` gets explicit buckets so it
/// renders as a histogram rather than a summary. Buckets span 10ms to 60s,
/// covering the request timeout plus retries.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    builder()?.install_recorder()
}

/// Record one tool invocation from the stdio protocol.
pub fn record_tool_call(tool: &str, outcome: &'static str) {
    metrics::counter!(
        "workspace_bridge_tool_calls_total",
        "tool" => tool.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

/// Router serving `/metrics` in text exposition format.
pub fn router(handle: PrometheusHandle) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(handle)
}

async fn metrics_handler(State(handle): State<PrometheusHandle>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        handle.render(),
    )
}
