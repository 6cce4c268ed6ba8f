//! Heartbeat Monitor
//!
//! The quoting service drives keep-alives: it sends `~h~<n>` frames which the
//! client must echo back unchanged. This module tracks traffic on the link so
//! the receive loop can declare the connection dead when the server goes
//! silent for longer than the idle timeout.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::Instant;

/// Configuration for heartbeat monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Maximum silence (no data and no heartbeat) before the link is
    /// considered dead.
    pub idle_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30),
        }
    }
}

impl HeartbeatConfig {
    /// Create a new configuration.
    #[must_use]
    pub const fn new(idle_timeout: Duration) -> Self {
        Self { idle_timeout }
    }

    /// Create configuration from `WebSocketSettings`.
    #[must_use]
    pub const fn from_websocket_settings(settings: &crate::WebSocketSettings) -> Self {
        Self {
            idle_timeout: settings.idle_timeout,
        }
    }
}

/// Link activity shared between the receive loop and statistics readers.
#[derive(Debug)]
pub struct HeartbeatState {
    last_activity: RwLock<Instant>,
    heartbeats_echoed: AtomicU64,
}

impl Default for HeartbeatState {
    fn default() -> Self {
        Self::new()
    }
}

impl HeartbeatState {
    /// Create new heartbeat state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_activity: RwLock::new(Instant::now()),
            heartbeats_echoed: AtomicU64::new(0),
        }
    }

    /// Record that a frame arrived.
    pub fn record_activity(&self) {
        *self.last_activity.write() = Instant::now();
    }

    /// Record that a heartbeat was echoed.
    pub fn record_echo(&self) {
        self.heartbeats_echoed.fetch_add(1, Ordering::Relaxed);
    }

    /// Total heartbeats echoed.
    #[must_use]
    pub fn heartbeats_echoed(&self) -> u64 {
        self.heartbeats_echoed.load(Ordering::Relaxed)
    }

    /// Time since the last frame arrived.
    #[must_use]
    pub fn time_since_activity(&self) -> Duration {
        self.last_activity.read().elapsed()
    }

    /// Instant at which the link becomes idle under `config`.
    #[must_use]
    pub fn idle_deadline(&self, config: &HeartbeatConfig) -> Instant {
        *self.last_activity.read() + config.idle_timeout
    }

    /// Whether the link has been silent longer than the idle timeout.
    #[must_use]
    pub fn is_idle(&self, config: &HeartbeatConfig) -> bool {
        self.time_since_activity() >= config.idle_timeout
    }

    /// Reset for a new connection.
    pub fn reset(&self) {
        *self.last_activity.write() = Instant::now();
    }
}
