//! Prometheus metrics exposition
//!
//! The rotation engine records through the `metrics` facade; this module
//! installs the Prometheus recorder and registers descriptions for:
//!
//! - `quota_limit_checks_total` (counter): label `status`
//! - `quota_account_rotations_total` (counter): label `reason`
//! - `quota_probe_failures_total` (counter): label `kind`
//! - `quota_storage_failures_total` (counter)
//! - `quota_remaining_fraction` (gauge): label `model`

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder and return a handle for rendering metrics.
pub fn install_recorder() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");
    describe();
    handle
}

/// Register help text for every metric the service emits.
pub fn describe() {
    metrics::describe_counter!(
        "quota_limit_checks_total",
        "Limit checks by resulting status"
    );
    metrics::describe_counter!(
        "quota_account_rotations_total",
        "Account rotations by reason"
    );
    metrics::describe_counter!(
        "quota_probe_failures_total",
        "Failed quota probes by failure kind"
    );
    metrics::describe_counter!(
        "quota_storage_failures_total",
        "Account file writes that failed"
    );
    metrics::describe_gauge!(
        "quota_remaining_fraction",
        "Last observed remaining quota fraction per model"
    );
}
