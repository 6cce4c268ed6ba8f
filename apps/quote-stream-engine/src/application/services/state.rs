//! Shared Engine State
//!
//! Everything the facade, the stream worker, and the reconnector share.
//! Registry, link state, and connection epoch live behind one mutex that is
//! never held across I/O or consumer callbacks.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard, RwLock};
use tokio::sync::{broadcast, mpsc};

use crate::domain::fanout::{ConsumerFault, SymbolSetHandle};
use crate::domain::streaming::SymbolKey;
use crate::domain::subscription::{SessionId, SessionRegistry, SubscriptionError};
use crate::infrastructure::metrics;
use crate::infrastructure::quote::HeartbeatState;

// =============================================================================
// Connection State
// =============================================================================

/// Link state reported to state-change listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection and none in progress.
    Disconnected,
    /// Opening a connection.
    Connecting,
    /// Handshake complete; subscriptions replayed.
    Connected,
    /// Waiting before the next reconnection attempt.
    Reconnecting {
        /// Attempt number, starting at 1.
        attempt: u32,
        /// Delay before the attempt, jitter included.
        delay: Duration,
    },
    /// Reconnection attempts exhausted. Terminal until shutdown.
    DisconnectedPermanent,
    /// The engine was shut down.
    Closed,
}

impl ConnectionState {
    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting { .. } => "reconnecting",
            Self::DisconnectedPermanent => "disconnected_permanent",
            Self::Closed => "closed",
        }
    }

    /// Whether the link is up.
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Whether no further transitions other than `Closed` can occur.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::DisconnectedPermanent | Self::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reconnecting { attempt, delay } => {
                write!(f, "reconnecting (attempt {attempt}, {}ms)", delay.as_millis())
            }
            other => f.write_str(other.as_str()),
        }
    }
}

/// Callback invoked on every connection state change.
pub type StateListener = Arc<dyn Fn(&ConnectionState) + Send + Sync>;

// =============================================================================
// Outbound Requests
// =============================================================================

/// Session changes queued by callers for the stream worker.
///
/// Each request is stamped with the connection epoch it was issued under;
/// requests from an earlier epoch are covered by the replay and dropped.
#[derive(Debug)]
pub(crate) enum Outbound {
    Open {
        key: SymbolKey,
        session_id: SessionId,
        epoch: u64,
    },
    Close {
        session_id: SessionId,
        epoch: u64,
    },
}

impl Outbound {
    pub(crate) const fn epoch(&self) -> u64 {
        match self {
            Self::Open { epoch, .. } | Self::Close { epoch, .. } => *epoch,
        }
    }
}

// =============================================================================
// Shared State
// =============================================================================

pub(crate) struct Inner {
    pub(crate) registry: SessionRegistry,
    pub(crate) state: ConnectionState,
    pub(crate) epoch: u64,
    pub(crate) closed: bool,
}

impl Inner {
    /// Apply a transition. Returns `false` when nothing changed or the
    /// engine is already closed.
    pub(crate) fn set_state(&mut self, next: ConnectionState) -> bool {
        if self.state == next || self.state == ConnectionState::Closed {
            return false;
        }
        self.state = next;
        true
    }
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) frames_received: AtomicU64,
    pub(crate) frame_errors: AtomicU64,
    pub(crate) updates_delivered: AtomicU64,
    pub(crate) consumer_faults: AtomicU64,
    pub(crate) rejections: AtomicU64,
    pub(crate) reconnects: AtomicU64,
}

impl Counters {
    pub(crate) fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    pub(crate) fn read(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

pub(crate) struct EngineShared {
    inner: Mutex<Inner>,
    listeners: RwLock<Vec<StateListener>>,
    pub(crate) outbound: mpsc::UnboundedSender<Outbound>,
    pub(crate) faults: broadcast::Sender<ConsumerFault>,
    pub(crate) heartbeat: Arc<HeartbeatState>,
    pub(crate) counters: Counters,
    pub(crate) started_at: Instant,
}

impl EngineShared {
    pub(crate) fn new(fault_capacity: usize) -> (Arc<Self>, mpsc::UnboundedReceiver<Outbound>) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (faults, _) = broadcast::channel(fault_capacity.max(1));

        let shared = Arc::new(Self {
            inner: Mutex::new(Inner {
                registry: SessionRegistry::new(),
                state: ConnectionState::Disconnected,
                epoch: 0,
                closed: false,
            }),
            listeners: RwLock::new(Vec::new()),
            outbound,
            faults,
            heartbeat: Arc::new(HeartbeatState::new()),
            counters: Counters::default(),
            started_at: Instant::now(),
        });

        (shared, outbound_rx)
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock()
    }

    pub(crate) fn add_listener(&self, listener: StateListener) {
        self.listeners.write().push(listener);
    }

    /// Move to `next` and notify listeners outside the lock.
    pub(crate) fn transition(&self, next: ConnectionState) {
        let changed = self.lock().set_state(next);
        if changed {
            self.emit(next);
        }
    }

    /// Notify listeners of a transition already applied under the lock.
    pub(crate) fn emit(&self, state: ConnectionState) {
        metrics::set_connection_state(state);
        tracing::info!(state = %state, "Connection state changed");

        let listeners = self.listeners.read().clone();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&state))).is_err() {
                tracing::warn!(state = %state, "State listener panicked");
            }
        }
    }

    pub(crate) fn publish_faults(&self, faults: Vec<ConsumerFault>) {
        for fault in faults {
            Counters::bump(&self.counters.consumer_faults, 1);
            metrics::record_consumer_fault();
            tracing::warn!(
                key = %fault.key,
                consumer = fault.consumer.order(),
                error = %fault.error,
                "Consumer fault during delivery"
            );
            // No receivers is fine.
            let _ = self.faults.send(fault);
        }
    }

    pub(crate) fn refresh_subscription_gauges(&self) {
        let counts = self.lock().registry.counts();
        metrics::set_subscriptions(counts);
    }
}

/// Deliver subscription errors collected under the lock.
pub(crate) fn notify_failures(failures: Vec<(SymbolSetHandle, SubscriptionError)>) {
    for (set, error) in failures {
        set.notify_error(&error);
    }
}
