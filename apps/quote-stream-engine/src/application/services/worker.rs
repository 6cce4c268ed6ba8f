//! Stream Worker
//!
//! The single task that owns the connection. It multiplexes caller
//! requests, inbound frames, and the idle deadline; routes data to symbol
//! sets; and hands link failures to the reconnector.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::application::services::reconnector::Reconnector;
use crate::application::services::state::{
    ConnectionState, Counters, EngineShared, Outbound, notify_failures,
};
use crate::domain::streaming::Update;
use crate::infrastructure::metrics;
use crate::infrastructure::quote::{
    Connection, ConnectionError, ControlFrame, ControlKind, DataFrame, Frame, ProtocolMessage,
    ReconnectError, TradingSession,
};

enum Event {
    Shutdown,
    Outbound(Outbound),
    Frame(Result<Frame, ConnectionError>),
    IdleCheck,
}

pub(crate) struct Worker {
    shared: Arc<EngineShared>,
    reconnector: Reconnector,
    outbound: mpsc::UnboundedReceiver<Outbound>,
    cancel: CancellationToken,
}

impl Worker {
    pub(crate) const fn new(
        shared: Arc<EngineShared>,
        reconnector: Reconnector,
        outbound: mpsc::UnboundedReceiver<Outbound>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            shared,
            reconnector,
            outbound,
            cancel,
        }
    }

    /// Run until shutdown or until reconnection gives up.
    pub(crate) async fn run(mut self) {
        let trading = self.reconnector.trading();
        let series_bars = self.reconnector.series_bars();

        loop {
            let connection = match self.reconnector.ensure_connected(&self.cancel).await {
                Ok(connection) => connection,
                Err(ReconnectError::Cancelled) => break,
                Err(e @ ReconnectError::MaxAttemptsExceeded(_)) => {
                    tracing::error!(error = %e, "Giving up on quote stream");
                    self.fail_permanently();
                    return;
                }
            };

            let deadline = connection.idle_deadline();
            let event = tokio::select! {
                biased;
                () = self.cancel.cancelled() => Event::Shutdown,
                request = self.outbound.recv() => request.map_or(Event::Shutdown, Event::Outbound),
                result = connection.recv() => Event::Frame(result),
                () = tokio::time::sleep_until(deadline) => Event::IdleCheck,
            };

            let outcome = match event {
                Event::Shutdown => break,
                Event::Outbound(request) => {
                    send_request(&self.shared, connection, request, trading, series_bars).await
                }
                Event::Frame(Ok(frame)) => handle_frame(&self.shared, connection, frame).await,
                Event::Frame(Err(e)) => Err(e),
                Event::IdleCheck => {
                    if tokio::time::Instant::now() >= connection.idle_deadline() {
                        Err(ConnectionError::IdleTimeout(connection.idle_timeout()))
                    } else {
                        Ok(())
                    }
                }
            };

            if let Err(error) = outcome {
                if matches!(error, ConnectionError::Frame(_)) {
                    Counters::bump(&self.shared.counters.frame_errors, 1);
                    metrics::record_frame_error();
                }
                tracing::warn!(error = %error, "Quote stream connection lost");
                self.reconnector.disconnect().await;
            }
        }

        self.reconnector.disconnect().await;
        tracing::debug!("Stream worker stopped");
    }

    fn fail_permanently(&self) {
        let (failures, changed) = {
            let mut inner = self.shared.lock();
            let failures = inner.registry.fail_all();
            let changed = inner.set_state(ConnectionState::DisconnectedPermanent);
            (failures, changed)
        };

        if changed {
            self.shared.emit(ConnectionState::DisconnectedPermanent);
        }
        tracing::warn!(failed = failures.len(), "Subscriptions failed after permanent disconnect");
        notify_failures(failures);
        self.shared.refresh_subscription_gauges();
    }
}

// =============================================================================
// Outbound Requests
// =============================================================================

async fn send_request(
    shared: &EngineShared,
    connection: &mut Connection,
    request: Outbound,
    trading: TradingSession,
    series_bars: u32,
) -> Result<(), ConnectionError> {
    let epoch = shared.lock().epoch;
    if request.epoch() != epoch {
        tracing::trace!(?request, "Request from an earlier connection dropped");
        return Ok(());
    }

    match request {
        Outbound::Open {
            key, session_id, ..
        } => {
            tracing::debug!(key = %key, session = %session_id, "Opening chart session");
            for message in ProtocolMessage::open_session(&session_id, &key, trading, series_bars) {
                connection.send(&message).await?;
            }
        }
        Outbound::Close { session_id, .. } => {
            tracing::debug!(session = %session_id, "Deleting chart session");
            connection
                .send(&ProtocolMessage::chart_delete_session(&session_id))
                .await?;
        }
    }
    Ok(())
}

// =============================================================================
// Inbound Frames
// =============================================================================

async fn handle_frame(
    shared: &EngineShared,
    connection: &mut Connection,
    frame: Frame,
) -> Result<(), ConnectionError> {
    Counters::bump(&shared.counters.frames_received, 1);

    match frame {
        Frame::Data(data) => {
            metrics::record_frame("data");
            deliver(shared, data);
            Ok(())
        }
        Frame::Control(control) => {
            let label = match &control.kind {
                ControlKind::Other(_) => "other",
                kind => kind.as_str(),
            };
            metrics::record_frame(label);
            handle_control(shared, connection, control).await
        }
    }
}

async fn handle_control(
    shared: &EngineShared,
    connection: &mut Connection,
    control: ControlFrame,
) -> Result<(), ConnectionError> {
    match control.kind {
        ControlKind::Heartbeat => {
            connection.echo_heartbeat(&control.payload).await?;
            metrics::record_heartbeat_echoed();
        }
        ControlKind::SymbolResolved | ControlKind::SeriesLoading | ControlKind::SeriesCompleted => {
            if let Some(session) = control.session_id.as_deref() {
                let known = shared.lock().registry.acknowledge(session);
                if known {
                    shared.refresh_subscription_gauges();
                } else {
                    tracing::trace!(session, kind = control.kind.as_str(), "Ack for unknown session");
                }
            }
        }
        ControlKind::SymbolError | ControlKind::SeriesError => reject(shared, &control),
        ControlKind::CriticalError | ControlKind::ProtocolError => {
            if control.session_id.is_some() {
                reject(shared, &control);
            } else {
                return Err(ConnectionError::Protocol(
                    control.reason.unwrap_or(control.payload),
                ));
            }
        }
        ControlKind::ServerHello => tracing::debug!("Unexpected server hello ignored"),
        ControlKind::Other(ref name) => tracing::trace!(message = %name, "Unhandled message"),
    }
    Ok(())
}

fn reject(shared: &EngineShared, control: &ControlFrame) {
    let Some(session) = control.session_id.as_deref() else {
        tracing::warn!(kind = control.kind.as_str(), "Error without session ignored");
        return;
    };
    let reason = control
        .reason
        .clone()
        .unwrap_or_else(|| control.kind.as_str().to_string());

    let rejected = shared.lock().registry.reject(session, reason.clone());
    let Some((set, error)) = rejected else {
        tracing::debug!(session, "Rejection for unknown session");
        return;
    };

    Counters::bump(&shared.counters.rejections, 1);
    metrics::record_subscription_rejected();
    shared.refresh_subscription_gauges();
    tracing::warn!(key = %set.key(), reason = %reason, "Subscription rejected");
    set.notify_error(&error);
}

fn deliver(shared: &EngineShared, data: DataFrame) {
    let routed = shared.lock().registry.route(&data.session_id);
    let Some(set) = routed else {
        metrics::record_frame_dropped();
        tracing::debug!(session = %data.session_id, "Data for unknown session dropped");
        return;
    };

    for bar in data.bars {
        let update = Update {
            key: set.key().clone(),
            bar,
        };
        let report = set.deliver(&update);
        let delivered = report.delivered as u64;
        Counters::bump(&shared.counters.updates_delivered, delivered);
        metrics::record_updates_delivered(delivered);
        shared.publish_faults(report.faults);
    }
}
