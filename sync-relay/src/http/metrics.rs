//! Prometheus metrics endpoint.

use crate::server::SignalRelay;
use axum::{http::header::CONTENT_TYPE, response::IntoResponse, Extension};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Render relay metrics in Prometheus text format.
///
/// Includes both gauges (current state) and counters (monotonic since startup).
pub fn render(relay: &SignalRelay) -> String {
    let m = relay.metrics();

    // Gauges - current state
    let connections = relay.active_connections();
    let joined = relay.joined_count();
    let limiter_keys = relay.rate_limits().signal_keys_count();

    // Counters - monotonic since startup
    let conns_total = m.connections_total.load(Ordering::Relaxed);
    let joins = m.joins_total.load(Ordering::Relaxed);
    let forwarded = m.signals_forwarded.load(Ordering::Relaxed);
    let undelivered = m.signals_undelivered.load(Ordering::Relaxed);
    let rate_limits = m.rate_limit_hits.load(Ordering::Relaxed);
    let errors = m.errors_total.load(Ordering::Relaxed);

    format!(
        r#"# HELP sync_relay_connections_active Number of open connections
# TYPE sync_relay_connections_active gauge
sync_relay_connections_active {connections}

# HELP sync_relay_joined_devices Number of joined device IDs
# TYPE sync_relay_joined_devices gauge
sync_relay_joined_devices {joined}

# HELP sync_relay_limiter_keys Devices tracked by the signal rate limiter
# TYPE sync_relay_limiter_keys gauge
sync_relay_limiter_keys {limiter_keys}

# HELP sync_relay_info Server information
# TYPE sync_relay_info gauge
sync_relay_info{{version="{version}"}} 1

# HELP sync_relay_connections_total Total connections accepted
# TYPE sync_relay_connections_total counter
sync_relay_connections_total {conns_total}

# HELP sync_relay_joins_total Total successful joins
# TYPE sync_relay_joins_total counter
sync_relay_joins_total {joins}

# HELP sync_relay_signals_forwarded_total Signals delivered to a joined device
# TYPE sync_relay_signals_forwarded_total counter
sync_relay_signals_forwarded_total {forwarded}

# HELP sync_relay_signals_undelivered_total Signals dropped (not joined or queue full)
# TYPE sync_relay_signals_undelivered_total counter
sync_relay_signals_undelivered_total {undelivered}

# HELP sync_relay_rate_limit_hits_total Total rate limit rejections
# TYPE sync_relay_rate_limit_hits_total counter
sync_relay_rate_limit_hits_total {rate_limits}

# HELP sync_relay_errors_total Total protocol errors
# TYPE sync_relay_errors_total counter
sync_relay_errors_total {errors}
"#,
        version = env!("CARGO_PKG_VERSION"),
    )
}

/// Prometheus metrics handler.
pub async fn metrics_handler(Extension(relay): Extension<Arc<SignalRelay>>) -> impl IntoResponse {
    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        render(&relay),
    )
}
