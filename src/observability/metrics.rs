//! Metrics collection and exposition.
//!
//! # Metrics
//! - `dispatch_messages_total{kind}` (counter): envelopes handled
//! - `dispatch_handler_faults_total{kind}` (counter): rolled-back invocations
//! - `dispatch_queue_depth` (gauge): envelopes waiting for the dispatch loop
//! - `http_requests_total{method,status}` (counter)
//! - `http_request_duration_seconds` (histogram)
//! - `listeners_active` (gauge), `listeners_created_total`,
//!   `listeners_destroyed_total`, `listener_setup_failures_total` (counters)
//! - `reload_cycles_total{result}` (counter)
//! - `websocket_sessions_active` (gauge)
//!
//! # Design Decisions
//! - Recorded through the `metrics` facade; without an installed recorder
//!   every call is a no-op
//! - The Prometheus exporter is optional and serves its own HTTP endpoint

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::net::registry::ReconcileReport;

/// Install the Prometheus recorder and its scrape endpoint.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics exporter listening");
    Ok(())
}

pub fn record_dispatch(kind: &'static str) {
    counter!("dispatch_messages_total", "kind" => kind).increment(1);
}

pub fn record_handler_fault(kind: &'static str) {
    counter!("dispatch_handler_faults_total", "kind" => kind).increment(1);
}

pub fn set_queue_depth(depth: usize) {
    gauge!("dispatch_queue_depth").set(depth as f64);
}

pub fn record_request(method: &str, status: u16, start: Instant) {
    counter!(
        "http_requests_total",
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!("http_request_duration_seconds").record(start.elapsed().as_secs_f64());
}

pub fn record_reconcile(report: &ReconcileReport, active: usize) {
    counter!("listeners_created_total").increment(report.created.len() as u64);
    counter!("listeners_destroyed_total").increment(report.destroyed.len() as u64);
    gauge!("listeners_active").set(active as f64);
}

pub fn record_listener_setup_failure() {
    counter!("listener_setup_failures_total").increment(1);
}

pub fn record_reload_cycle(result: &'static str) {
    counter!("reload_cycles_total", "result" => result).increment(1);
}

pub fn websocket_session_opened() {
    gauge!("websocket_sessions_active").increment(1.0);
}

pub fn websocket_session_closed() {
    gauge!("websocket_sessions_active").decrement(1.0);
}
