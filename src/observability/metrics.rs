//! Metrics collection and exposition.
//!
//! # Metrics
//! - `proxy_connections_accepted_total` (counter): client connections accepted
//! - `proxy_active_connections` (gauge): live client connections
//! - `proxy_resolution_failures_total` (counter): connections matching no binding
//! - `proxy_frames_total` (counter): frames by `direction` and `disposition`
//! - `proxy_filter_errors_total` (counter): failed filter invocations by `filter`
//! - `proxy_socket_binds_total` / `proxy_socket_unbinds_total` (counters)
//!
//! # Design Decisions
//! - Recording is a no-op until a recorder is installed, so tests need no setup
//! - Exposed through the Prometheus exporter's own HTTP listener

use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

/// Install the Prometheus recorder and its scrape endpoint.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_connection_accepted() {
    ::metrics::counter!("proxy_connections_accepted_total").increment(1);
}

pub fn set_active_connections(active: u64) {
    ::metrics::gauge!("proxy_active_connections").set(active as f64);
}

pub fn record_resolution_failure() {
    ::metrics::counter!("proxy_resolution_failures_total").increment(1);
}

/// `direction` is `request` or `response`; `disposition` what became of the frame.
pub fn record_frame(direction: &'static str, disposition: &'static str) {
    ::metrics::counter!("proxy_frames_total", "direction" => direction, "disposition" => disposition).increment(1);
}

pub fn record_filter_error(filter: &str) {
    ::metrics::counter!("proxy_filter_errors_total", "filter" => filter.to_string()).increment(1);
}

pub fn record_socket_bind() {
    ::metrics::counter!("proxy_socket_binds_total").increment(1);
}

pub fn record_socket_unbind() {
    ::metrics::counter!("proxy_socket_unbinds_total").increment(1);
}
