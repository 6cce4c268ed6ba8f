//! Reconnector
//!
//! Owns the live connection. Opens it, replays every live subscription
//! after each successful handshake, and on failure retries with backoff
//! until the attempt ceiling is reached.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::application::ports::Connector;
use crate::application::services::state::{ConnectionState, Counters, EngineShared};
use crate::infrastructure::config::{Credential, SessionSettings};
use crate::infrastructure::metrics;
use crate::infrastructure::quote::{
    ConnectError, Connection, ConnectionSettings, ProtocolMessage, ReconnectError,
    ReconnectPolicy, TradingSession,
};

pub(crate) struct Reconnector {
    connector: Arc<dyn Connector>,
    credential: Credential,
    settings: ConnectionSettings,
    policy: ReconnectPolicy,
    trading: TradingSession,
    series_bars: u32,
    shared: Arc<EngineShared>,
    connection: Option<Connection>,
}

impl Reconnector {
    pub(crate) fn new(
        connector: Arc<dyn Connector>,
        credential: Credential,
        settings: ConnectionSettings,
        policy: ReconnectPolicy,
        session: &SessionSettings,
        shared: Arc<EngineShared>,
    ) -> Self {
        Self {
            connector,
            credential,
            settings,
            policy,
            trading: session.trading_session,
            series_bars: session.series_bars,
            shared,
            connection: None,
        }
    }

    pub(crate) const fn trading(&self) -> TradingSession {
        self.trading
    }

    pub(crate) const fn series_bars(&self) -> u32 {
        self.series_bars
    }

    /// Single attempt used by `start`. No retry: the caller sees the error.
    pub(crate) async fn connect_initial(&mut self) -> Result<(), ConnectError> {
        self.shared.transition(ConnectionState::Connecting);

        match self.establish().await {
            Ok(connection) => {
                self.connection = Some(connection);
                self.policy.reset();
                self.shared.transition(ConnectionState::Connected);
                Ok(())
            }
            Err(e) => {
                self.shared.transition(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Return the live connection, reconnecting with backoff if there is none.
    pub(crate) async fn ensure_connected(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<&mut Connection, ReconnectError> {
        let connection = match self.connection.take() {
            Some(connection) => connection,
            None => self.reconnect(cancel).await?,
        };
        Ok(self.connection.insert(connection))
    }

    /// Close and forget the current connection, if any.
    pub(crate) async fn disconnect(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            connection.close().await;
        }
    }

    async fn reconnect(&mut self, cancel: &CancellationToken) -> Result<Connection, ReconnectError> {
        loop {
            let Some(delay) = self.policy.next_delay() else {
                return Err(ReconnectError::MaxAttemptsExceeded(
                    self.policy.attempt_count(),
                ));
            };
            let attempt = self.policy.attempt_count();

            Counters::bump(&self.shared.counters.reconnects, 1);
            metrics::record_reconnect();
            tracing::info!(
                attempt,
                delay_ms = delay.as_millis(),
                "Reconnecting to quote stream"
            );
            self.shared
                .transition(ConnectionState::Reconnecting { attempt, delay });

            tokio::select! {
                () = cancel.cancelled() => {
                    tracing::info!("Reconnect cancelled during backoff");
                    return Err(ReconnectError::Cancelled);
                }
                () = tokio::time::sleep(delay) => {}
            }

            self.shared.transition(ConnectionState::Connecting);

            let result = tokio::select! {
                () = cancel.cancelled() => return Err(ReconnectError::Cancelled),
                result = self.establish() => result,
            };

            match result {
                Ok(connection) => {
                    self.policy.reset();
                    self.shared.transition(ConnectionState::Connected);
                    return Ok(connection);
                }
                Err(e) => tracing::warn!(attempt, error = %e, "Reconnect attempt failed"),
            }
        }
    }

    /// Open a connection and replay every live subscription on it.
    async fn establish(&mut self) -> Result<Connection, ConnectError> {
        tracing::info!("Connecting to quote stream");

        let mut connection = Connection::open(
            self.connector.as_ref(),
            &self.credential,
            self.settings,
            Arc::clone(&self.shared.heartbeat),
        )
        .await?;

        let replay = {
            let mut inner = self.shared.lock();
            inner.epoch += 1;
            inner.registry.rebind_for_replay()
        };

        for (key, session_id) in &replay {
            for message in
                ProtocolMessage::open_session(session_id, key, self.trading, self.series_bars)
            {
                if let Err(e) = connection.send(&message).await {
                    connection.close().await;
                    return Err(ConnectError::Handshake(e));
                }
            }
        }

        self.shared.refresh_subscription_gauges();
        tracing::info!(replayed = replay.len(), "Quote stream connected");
        Ok(connection)
    }
}
