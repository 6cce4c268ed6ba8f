//! Prometheus Metrics Module
//!
//! Exposes engine metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Frames**: Inbound frames by kind, decode failures, unroutable data
//! - **Delivery**: Updates handed to consumers and consumer faults
//! - **Subscriptions**: Live subscriptions by status and rejections
//! - **Connection**: Link state and reconnection attempts
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port.

use std::sync::OnceLock;

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::application::services::ConnectionState;
use crate::domain::subscription::SubscriptionCounts;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Subsequent calls return the handle installed by the first one.
///
/// # Errors
///
/// Returns an error if the global recorder cannot be installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();

    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Frame counters
    describe_counter!(
        "quote_stream_frames_received_total",
        "Total frames received from the quoting service by kind"
    );
    describe_counter!(
        "quote_stream_frame_errors_total",
        "Total frames that failed to decode"
    );
    describe_counter!(
        "quote_stream_frames_dropped_total",
        "Total data frames dropped because their session was unknown"
    );
    describe_counter!(
        "quote_stream_heartbeats_echoed_total",
        "Total heartbeats echoed back to the server"
    );

    // Delivery counters
    describe_counter!(
        "quote_stream_updates_delivered_total",
        "Total bar updates handed to consumers"
    );
    describe_counter!(
        "quote_stream_consumer_faults_total",
        "Total consumer errors and panics during delivery"
    );

    // Subscription gauges
    describe_gauge!(
        "quote_stream_subscriptions",
        "Subscriptions by status"
    );
    describe_counter!(
        "quote_stream_subscription_rejections_total",
        "Total subscriptions rejected by the server"
    );

    // Connection
    describe_gauge!(
        "quote_stream_connection_state",
        "Connection state (0=disconnected 1=connecting 2=connected 3=reconnecting 4=permanent 5=closed)"
    );
    describe_counter!(
        "quote_stream_reconnects_total",
        "Total reconnection attempts"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Record a frame received from the quoting service.
pub fn record_frame(kind: &str) {
    counter!(
        "quote_stream_frames_received_total",
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// Record a frame that failed to decode.
pub fn record_frame_error() {
    counter!("quote_stream_frame_errors_total").increment(1);
}

/// Record a data frame dropped for an unknown session.
pub fn record_frame_dropped() {
    counter!("quote_stream_frames_dropped_total").increment(1);
}

/// Record an echoed heartbeat.
pub fn record_heartbeat_echoed() {
    counter!("quote_stream_heartbeats_echoed_total").increment(1);
}

/// Record updates delivered to consumers.
pub fn record_updates_delivered(count: u64) {
    counter!("quote_stream_updates_delivered_total").increment(count);
}

/// Record a consumer fault.
pub fn record_consumer_fault() {
    counter!("quote_stream_consumer_faults_total").increment(1);
}

/// Record a rejected subscription.
pub fn record_subscription_rejected() {
    counter!("quote_stream_subscription_rejections_total").increment(1);
}

/// Record a reconnection attempt.
pub fn record_reconnect() {
    counter!("quote_stream_reconnects_total").increment(1);
}

/// Update the subscription gauges.
#[allow(clippy::cast_precision_loss)]
pub fn set_subscriptions(counts: SubscriptionCounts) {
    gauge!("quote_stream_subscriptions", "status" => "pending").set(counts.pending as f64);
    gauge!("quote_stream_subscriptions", "status" => "active").set(counts.active as f64);
    gauge!("quote_stream_subscriptions", "status" => "failed").set(counts.failed as f64);
}

/// Update the connection state gauge.
pub fn set_connection_state(state: ConnectionState) {
    gauge!("quote_stream_connection_state").set(state_code(state));
}

const fn state_code(state: ConnectionState) -> f64 {
    match state {
        ConnectionState::Disconnected => 0.0,
        ConnectionState::Connecting => 1.0,
        ConnectionState::Connected => 2.0,
        ConnectionState::Reconnecting { .. } => 3.0,
        ConnectionState::DisconnectedPermanent => 4.0,
        ConnectionState::Closed => 5.0,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn state_codes_are_distinct() {
        let states = [
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Reconnecting {
                attempt: 1,
                delay: Duration::from_secs(1),
            },
            ConnectionState::DisconnectedPermanent,
            ConnectionState::Closed,
        ];

        let mut codes: Vec<f64> = states.iter().map(|s| state_code(*s)).collect();
        codes.dedup();
        assert_eq!(codes.len(), states.len());
    }

    #[test]
    fn recording_without_recorder_is_a_noop() {
        record_frame("du");
        record_updates_delivered(3);
        set_subscriptions(SubscriptionCounts::default());
        set_connection_state(ConnectionState::Connected);
    }
}
