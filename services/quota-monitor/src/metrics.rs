//! Prometheus metrics exposition
//!
//! - `quota_utilization_ratio` (gauge): label `window` (`5h`, `7d`)
//! - `quota_poll_interval_seconds` (gauge)
//! - `quota_fetches_total` (counter): label `outcome` (`success`, `error`)
//! - `quota_fetches_skipped_total` (counter): ticks dropped while a fetch was in flight
//! - `quota_token_refreshes_total` (counter): recorded by `anthropic-quota`

use anthropic_quota::QuotaInfo;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Install the Prometheus recorder and return a handle for rendering metrics.
pub fn install_recorder() -> PrometheusHandle {
    PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Record a completed fetch and, on success, the utilization it reported.
pub fn record_fetch(quota: Option<&QuotaInfo>) {
    let outcome = if quota.is_some() { "success" } else { "error" };
    metrics::counter!("quota_fetches_total", "outcome" => outcome).increment(1);
    if let Some(q) = quota {
        metrics::gauge!("quota_utilization_ratio", "window" => "5h").set(q.utilization_5h);
        metrics::gauge!("quota_utilization_ratio", "window" => "7d").set(q.utilization_7d);
    }
}

pub fn record_skipped_tick() {
    metrics::counter!("quota_fetches_skipped_total").increment(1);
}

pub fn set_poll_interval(interval: Duration) {
    metrics::gauge!("quota_poll_interval_seconds").set(interval.as_secs_f64());
}
