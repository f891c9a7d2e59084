//! Metrics collection and exposition.
//!
//! # Metrics
//! - `conductor_proxy_requests_total` (counter): proxy admin API calls by method, status
//! - `conductor_proxy_conflicts_total` (counter): ETag conflicts retried
//! - `conductor_hook_runs_total` (counter): hook executions by phase, result
//! - `conductor_policy_decisions_total` (counter): sidecar decisions by policy, result

use std::net::SocketAddr;

use metrics::counter;
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus exporter on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_proxy_request(method: &'static str, status: u16) {
    counter!(
        "conductor_proxy_requests_total",
        "method" => method,
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_proxy_conflict() {
    counter!("conductor_proxy_conflicts_total").increment(1);
}

pub fn record_hook(phase: &str, ok: bool) {
    counter!(
        "conductor_hook_runs_total",
        "phase" => phase.to_string(),
        "result" => if ok { "ok" } else { "error" }
    )
    .increment(1);
}

pub fn record_policy_decision(policy: &str, matched: bool) {
    counter!(
        "conductor_policy_decisions_total",
        "policy" => policy.to_string(),
        "result" => if matched { "allow" } else { "deny" }
    )
    .increment(1);
}
