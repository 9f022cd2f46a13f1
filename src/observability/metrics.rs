//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define supervisor metrics (pool size, spawns, reaps, timeouts)
//! - Expose Prometheus-compatible metrics endpoint from the master
//!
//! # Metrics
//! - `prefork_workers` (gauge): live worker records
//! - `prefork_workers_spawned_total` (counter)
//! - `prefork_workers_reaped_total` (counter): by exit `status`
//! - `prefork_worker_timeouts_total` (counter)
//! - `prefork_reloads_total` (counter): by `outcome`
//! - `prefork_upgrades_total` (counter): by `outcome`
//!
//! # Design Decisions
//! - Facade macros are no-ops until a recorder is installed
//! - Exporter failures are logged, never fatal

use std::net::SocketAddr;

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder with an HTTP listener on `addr`.
///
/// Must be called from within the master's runtime.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to start metrics exporter"),
    }
}

pub fn set_worker_count(count: usize) {
    gauge!("prefork_workers").set(count as f64);
}

pub fn record_worker_spawned() {
    counter!("prefork_workers_spawned_total").increment(1);
}

pub fn record_worker_reaped(success: bool) {
    let status = if success { "ok" } else { "error" };
    counter!("prefork_workers_reaped_total", "status" => status).increment(1);
}

pub fn record_worker_timeout() {
    counter!("prefork_worker_timeouts_total").increment(1);
}

pub fn record_reload(outcome: &'static str) {
    counter!("prefork_reloads_total", "outcome" => outcome).increment(1);
}

pub fn record_upgrade(outcome: &'static str) {
    counter!("prefork_upgrades_total", "outcome" => outcome).increment(1);
}
