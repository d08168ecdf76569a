//! Prometheus metrics exposition
//!
//! Registers and exposes the gateway's metrics:
//!
//! - `gateway_requests_total` (counter): labels `provider`, `status`
//! - `gateway_request_duration_seconds` (histogram): label `provider`
//! - `gateway_upstream_errors_total` (counter): labels `provider`, `kind`
//! - `gateway_failovers_total` (counter): label `from`

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder and return a handle for rendering.
///
/// `gateway_request_duration_seconds` gets explicit buckets so it renders
/// as a histogram (with `_bucket` lines for `histogram_quantile()` queries)
/// rather than the default summary. The range covers sub-10ms local
/// backends up to minutes-long streamed completions.
pub fn install_recorder() -> PrometheusHandle {
    const DURATION_BUCKETS: &[f64] = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
    ];

    PrometheusBuilder::new()
        .set_buckets_for_metric(
            metrics_exporter_prometheus::Matcher::Full(
                "gateway_request_duration_seconds".to_string(),
            ),
            DURATION_BUCKETS,
        )
        .expect("bucket list is non-empty")
        .install_recorder()
        .expect("metrics recorder installation failed")
}

pub fn record_request(provider: &str, status: u16) {
    counter!(
        "gateway_requests_total",
        "provider" => provider.to_string(),
        "status" => status.to_string(),
    )
    .increment(1);
}

pub fn record_duration(provider: &str, seconds: f64) {
    histogram!(
        "gateway_request_duration_seconds",
        "provider" => provider.to_string(),
    )
    .record(seconds);
}

pub fn record_upstream_error(provider: &str, kind: &'static str) {
    counter!(
        "gateway_upstream_errors_total",
        "provider" => provider.to_string(),
        "kind" => kind,
    )
    .increment(1);
}

pub fn record_failover(from: &str) {
    counter!(
        "gateway_failovers_total",
        "from" => from.to_string(),
    )
    .increment(1);
}
