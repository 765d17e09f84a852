//! Metrics collection and Prometheus export.
//!
//! Counters are recorded through the `metrics` facade; until
//! [`init_metrics`] installs a recorder they are no-ops.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

pub const REDEMPTIONS_TOTAL: &str = "codegate_redemptions_total";
pub const LOCK_DEGRADED_TOTAL: &str = "codegate_lock_degraded_total";

/// Global handle to the Prometheus recorder.
pub static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the metrics recorder.
///
/// Call once at startup before any metrics are recorded.
pub fn init_metrics() -> anyhow::Result<()> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    if METRICS_HANDLE.set(handle).is_err() {
        anyhow::bail!("metrics recorder already initialized");
    }
    Ok(())
}

/// Get the current metrics in Prometheus text format.
pub fn render() -> String {
    METRICS_HANDLE
        .get()
        .map(|handle| handle.render())
        .unwrap_or_else(|| "# Metrics recorder not initialized".to_string())
}

/// Counts one finished `redeem` or `validate` call by outcome.
pub fn record_outcome(operation: &'static str, outcome: &'static str) {
    ::metrics::counter!(REDEMPTIONS_TOTAL, "operation" => operation, "outcome" => outcome)
        .increment(1);
}

/// Counts a redemption that proceeded without holding the distributed mutex.
pub fn record_lock_degraded(reason: &'static str) {
    ::metrics::counter!(LOCK_DEGRADED_TOTAL, "reason" => reason).increment(1);
}
