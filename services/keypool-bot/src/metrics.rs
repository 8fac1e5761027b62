//! Prometheus metrics exposition
//!
//! Metrics recorded by the pool and scheduler:
//!
//! - `keypool_ticks_total` (counter): labels `job`, `outcome`
//! - `keypool_tick_duration_seconds` (histogram): label `job`
//! - `keypool_admissions_total` (counter): label `outcome`
//! - `keypool_evictions_total` (counter): label `reason`
//! - `keypool_validations_total` (counter): label `verdict`
//! - `keypool_members` (gauge)
//! - `keypool_admin_requests_total` (counter): labels `route`, `status`

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

/// Tick durations range from a local file read to a full mirror round trip.
const TICK_BUCKETS: &[f64] = &[
    0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0,
];

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new().set_buckets_for_metric(
        Matcher::Full("keypool_tick_duration_seconds".to_string()),
        TICK_BUCKETS,
    )
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    builder()?.install_recorder()
}

/// Record an operator API call.
pub fn record_admin_request(route: &'static str, status: u16) {
    metrics::counter!(
        "keypool_admin_requests_total",
        "route" => route,
        "status" => status.to_string()
    )
    .increment(1);
}
