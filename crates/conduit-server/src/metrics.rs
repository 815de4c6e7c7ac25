//! Metrics collection and export for Conduit.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use anyhow::{Context, Result};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "conduit_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "conduit_connections_active";
    pub const CONNECTIONS_REJECTED: &str = "conduit_connections_rejected_total";
    pub const FRAMES_TOTAL: &str = "conduit_frames_total";
    pub const FRAMES_BYTES: &str = "conduit_frames_bytes";
    pub const RESPONSES_TOTAL: &str = "conduit_responses_total";
    pub const GROUPS_ACTIVE: &str = "conduit_groups_active";
    pub const DISPATCH_SECONDS: &str = "conduit_dispatch_seconds";
    pub const ERRORS_TOTAL: &str = "conduit_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(
        names::CONNECTIONS_REJECTED,
        "Connections refused because the server was full"
    );
    metrics::describe_counter!(names::FRAMES_TOTAL, "Total number of frames processed");
    metrics::describe_counter!(names::FRAMES_BYTES, "Total bytes of frames processed");
    metrics::describe_counter!(names::RESPONSES_TOTAL, "Responses sent, by status");
    metrics::describe_gauge!(names::GROUPS_ACTIVE, "Current number of notification groups");
    metrics::describe_histogram!(
        names::DISPATCH_SECONDS,
        "Request dispatch latency in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the exporter cannot be installed.
pub fn start_metrics_server(port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a refused connection.
pub fn record_rejected() {
    counter!(names::CONNECTIONS_REJECTED).increment(1);
}

/// Record a frame.
pub fn record_frame(bytes: usize, direction: &'static str) {
    counter!(names::FRAMES_TOTAL, "direction" => direction).increment(1);
    counter!(names::FRAMES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record how long a request took to dispatch, and its status.
pub fn record_dispatch(seconds: f64, status: u16) {
    histogram!(names::DISPATCH_SECONDS).record(seconds);
    counter!(names::RESPONSES_TOTAL, "status" => status.to_string()).increment(1);
}

/// Update active group count.
pub fn set_active_groups(count: usize) {
    gauge!(names::GROUPS_ACTIVE).set(count as f64);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        counter!(names::CONNECTIONS_TOTAL).increment(1);
        gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
    }
}
