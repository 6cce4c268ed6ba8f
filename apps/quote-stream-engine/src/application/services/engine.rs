//! Stream Engine
//!
//! Public facade. Callers create symbol sets, attach consumers to them, and
//! observe connection state; a single background worker owns the socket.
//!
//! # Lifecycle
//!
//! ```text
//! new ──► start ──► Connected ◄──► Reconnecting ──► DisconnectedPermanent
//!                       │                                   │
//!                       └──────────── shutdown ──► Closed ◄─┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::application::ports::Connector;
use crate::application::services::reconnector::Reconnector;
use crate::application::services::state::{
    ConnectionState, Counters, EngineShared, Outbound, StateListener,
};
use crate::application::services::worker::Worker;
use crate::domain::fanout::{ConsumerFault, DeliveryPolicy, SymbolSetHandle};
use crate::domain::streaming::{Interval, SymbolKey};
use crate::domain::subscription::{SubscriptionCounts, Unsubscribed};
use crate::infrastructure::config::EngineConfig;
use crate::infrastructure::quote::{
    ConnectError, ConnectionSettings, ReconnectConfig, ReconnectPolicy,
};

// =============================================================================
// Errors
// =============================================================================

/// Errors surfaced by the engine facade.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The initial connection could not be established.
    #[error("failed to connect: {0}")]
    Connect(#[from] ConnectError),

    /// `start` was called on a running engine.
    #[error("engine already started")]
    AlreadyStarted,

    /// The engine gave up reconnecting.
    #[error("engine permanently disconnected")]
    PermanentlyDisconnected,

    /// The engine was shut down.
    #[error("engine is shut down")]
    Closed,
}

// =============================================================================
// Statistics
// =============================================================================

/// Point-in-time engine statistics.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    /// Connection state name.
    pub state: &'static str,
    /// Current reconnect attempt (0 unless reconnecting).
    pub reconnect_attempt: u32,
    /// Distinct subscribed series.
    pub symbol_sets: usize,
    /// Subscriptions by status.
    pub subscriptions: SubscriptionCounts,
    /// Routable chart sessions.
    pub sessions: usize,
    /// Frames received since start.
    pub frames_received: u64,
    /// Frames that failed to decode.
    pub frame_errors: u64,
    /// Data frames dropped for unknown sessions.
    pub frames_dropped: u64,
    /// Heartbeats echoed.
    pub heartbeats_echoed: u64,
    /// Updates handed to consumers.
    pub updates_delivered: u64,
    /// Consumer errors and panics.
    pub consumer_faults: u64,
    /// Subscriptions rejected by the server.
    pub rejections: u64,
    /// Reconnection attempts.
    pub reconnects: u64,
    /// Seconds since the last inbound traffic.
    pub idle_secs: f64,
    /// Seconds since the engine was created.
    pub uptime_secs: u64,
}

// =============================================================================
// Engine
// =============================================================================

/// Multiplexes chart subscriptions over one quote stream connection.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
///
/// use quote_stream_engine::{EngineConfig, Interval, StreamEngine, WebSocketConnector};
///
/// # async fn run() -> anyhow::Result<()> {
/// let config = EngineConfig::from_env()?;
/// let connector = Arc::new(WebSocketConnector::from_settings(&config.websocket));
/// let engine = StreamEngine::new(config, connector);
///
/// engine.start().await?;
/// let set = engine.create_symbol_set("BTCUSD", "BINANCE", Interval::Minute1)?;
/// set.create_consumer_fn(|update| {
///     println!("{} close={}", update.key, update.bar.close);
///     Ok(())
/// });
///
/// engine.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct StreamEngine {
    config: EngineConfig,
    connector: Arc<dyn Connector>,
    shared: Arc<EngineShared>,
    outbound_rx: parking_lot::Mutex<Option<tokio::sync::mpsc::UnboundedReceiver<Outbound>>>,
    worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for StreamEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamEngine")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl StreamEngine {
    /// Create an engine. Nothing is connected until [`StreamEngine::start`].
    #[must_use]
    pub fn new(config: EngineConfig, connector: Arc<dyn Connector>) -> Self {
        let (shared, outbound_rx) = EngineShared::new(config.session.fault_channel_capacity);
        Self {
            config,
            connector,
            shared,
            outbound_rx: parking_lot::Mutex::new(Some(outbound_rx)),
            worker: tokio::sync::Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    /// Register a connection state listener.
    ///
    /// Listeners run on the engine's tasks; they should return quickly.
    pub fn on_state_change<F>(&self, listener: F)
    where
        F: Fn(&ConnectionState) + Send + Sync + 'static,
    {
        let listener: StateListener = Arc::new(listener);
        self.shared.add_listener(listener);
    }

    /// Connect, replay any symbol sets created so far, and spawn the worker.
    ///
    /// The first connection attempt is not retried; later failures are
    /// handled by reconnecting in the background.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Connect`] if the handshake fails,
    /// [`EngineError::AlreadyStarted`] on a second call, and
    /// [`EngineError::Closed`] after shutdown.
    pub async fn start(&self) -> Result<(), EngineError> {
        let mut worker = self.worker.lock().await;
        if self.shared.lock().closed {
            return Err(EngineError::Closed);
        }
        let Some(outbound_rx) = self.outbound_rx.lock().take() else {
            return Err(EngineError::AlreadyStarted);
        };

        let websocket = &self.config.websocket;
        let mut reconnector = Reconnector::new(
            Arc::clone(&self.connector),
            self.config.credential.clone(),
            ConnectionSettings::from_websocket_settings(websocket),
            ReconnectPolicy::new(ReconnectConfig::from_websocket_settings(websocket)),
            &self.config.session,
            Arc::clone(&self.shared),
        );

        if let Err(e) = reconnector.connect_initial().await {
            tracing::error!(error = %e, "Initial connection failed");
            *self.outbound_rx.lock() = Some(outbound_rx);
            return Err(EngineError::Connect(e));
        }

        let task = Worker::new(
            Arc::clone(&self.shared),
            reconnector,
            outbound_rx,
            self.cancel.clone(),
        );
        *worker = Some(tokio::spawn(task.run()));

        tracing::info!("Stream engine started");
        Ok(())
    }

    /// Subscribe to a series with the configured default delivery policy.
    ///
    /// Repeated calls for the same series return the same symbol set.
    ///
    /// # Errors
    ///
    /// Returns an error once the engine is shut down or permanently
    /// disconnected.
    pub fn create_symbol_set(
        &self,
        symbol: impl Into<String>,
        exchange: impl Into<String>,
        interval: Interval,
    ) -> Result<SymbolSetHandle, EngineError> {
        let key = SymbolKey::new(symbol, exchange, interval);
        self.create_symbol_set_with(key, self.config.session.delivery_policy)
    }

    /// Subscribe to a series with an explicit delivery policy.
    ///
    /// The policy only applies when this call creates the symbol set.
    ///
    /// # Errors
    ///
    /// Returns an error once the engine is shut down or permanently
    /// disconnected.
    pub fn create_symbol_set_with(
        &self,
        key: SymbolKey,
        policy: DeliveryPolicy,
    ) -> Result<SymbolSetHandle, EngineError> {
        let handle = {
            let mut inner = self.shared.lock();
            if inner.closed {
                return Err(EngineError::Closed);
            }
            if inner.state == ConnectionState::DisconnectedPermanent {
                return Err(EngineError::PermanentlyDisconnected);
            }

            let subscribed = inner.registry.subscribe(key.clone(), policy);
            // Queued under the lock so open and close stay ordered.
            if let Some(session_id) = subscribed.close {
                let _ = self.shared.outbound.send(Outbound::Close {
                    session_id,
                    epoch: inner.epoch,
                });
            }
            if let Some(session_id) = subscribed.open {
                let _ = self.shared.outbound.send(Outbound::Open {
                    key: key.clone(),
                    session_id,
                    epoch: inner.epoch,
                });
            }
            subscribed.handle
        };

        tracing::debug!(key = %key, "Symbol set created");
        self.shared.refresh_subscription_gauges();
        Ok(handle)
    }

    /// Release one reference to a symbol set.
    ///
    /// When the last reference goes, the chart session is deleted and the
    /// set's consumers receive `on_closed`. Returns `false` if the handle was
    /// not registered.
    pub fn remove_symbol_set(&self, handle: &SymbolSetHandle) -> bool {
        let outcome = {
            let mut inner = self.shared.lock();
            let outcome = inner.registry.unsubscribe(handle);
            if let Unsubscribed::Released {
                close: Some(ref session_id),
                ..
            } = outcome
            {
                let _ = self.shared.outbound.send(Outbound::Close {
                    session_id: session_id.clone(),
                    epoch: inner.epoch,
                });
            }
            outcome
        };

        match outcome {
            Unsubscribed::Retained { refcount } => {
                tracing::debug!(key = %handle.key(), refcount, "Symbol set reference released");
                true
            }
            Unsubscribed::Released { handle: set, .. } => {
                tracing::debug!(key = %set.key(), "Symbol set removed");
                set.close();
                self.shared.refresh_subscription_gauges();
                true
            }
            Unsubscribed::Unknown => false,
        }
    }

    /// Subscribe to consumer faults.
    #[must_use]
    pub fn faults(&self) -> broadcast::Receiver<ConsumerFault> {
        self.shared.faults.subscribe()
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    /// Look up a live symbol set.
    #[must_use]
    pub fn symbol_set(&self, key: &SymbolKey) -> Option<SymbolSetHandle> {
        self.shared.lock().registry.get(key)
    }

    /// Snapshot of engine statistics.
    #[must_use]
    pub fn stats(&self) -> EngineStats {
        let (state, symbol_sets, subscriptions, sessions, frames_dropped) = {
            let inner = self.shared.lock();
            (
                inner.state,
                inner.registry.len(),
                inner.registry.counts(),
                inner.registry.session_count(),
                inner.registry.dropped_unknown(),
            )
        };
        let counters = &self.shared.counters;
        let reconnect_attempt = match state {
            ConnectionState::Reconnecting { attempt, .. } => attempt,
            _ => 0,
        };

        EngineStats {
            state: state.as_str(),
            reconnect_attempt,
            symbol_sets,
            subscriptions,
            sessions,
            frames_received: Counters::read(&counters.frames_received),
            frame_errors: Counters::read(&counters.frame_errors),
            frames_dropped,
            heartbeats_echoed: self.shared.heartbeat.heartbeats_echoed(),
            updates_delivered: Counters::read(&counters.updates_delivered),
            consumer_faults: Counters::read(&counters.consumer_faults),
            rejections: Counters::read(&counters.rejections),
            reconnects: Counters::read(&counters.reconnects),
            idle_secs: self.shared.heartbeat.time_since_activity().as_secs_f64(),
            uptime_secs: self.shared.started_at.elapsed().as_secs(),
        }
    }

    /// Configured idle timeout.
    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        self.config.websocket.idle_timeout
    }

    /// Stop the worker, close the socket, and release every symbol set.
    ///
    /// Idempotent; concurrent callers return once the first has finished.
    pub async fn shutdown(&self) {
        let mut worker = self.worker.lock().await;
        {
            let mut inner = self.shared.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
        }

        tracing::info!("Shutting down stream engine");
        self.cancel.cancel();

        if let Some(handle) = worker.take() {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Stream worker ended abnormally");
            }
        }

        let released = self.shared.lock().registry.release_all();
        for set in &released {
            set.close();
        }
        self.shared.refresh_subscription_gauges();
        self.shared.transition(ConnectionState::Closed);

        tracing::info!(released = released.len(), "Stream engine stopped");
    }
}

impl Drop for StreamEngine {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
