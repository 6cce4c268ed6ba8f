//! Quote Stream Connection
//!
//! Owns one physical transport: performs the handshake, reassembles frames
//! from socket reads, echoes heartbeats and sends protocol messages.
//!
//! # Handshake
//!
//! 1. Open the transport through the [`Connector`]
//! 2. Wait for the server hello, echoing any heartbeat that arrives first
//! 3. Present the credential with `set_auth_token` (anonymous token when none)
//!
//! All I/O for a connection happens on the task that owns it.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::application::ports::{Connector, Transport, TransportError};
use crate::infrastructure::config::Credential;
use crate::infrastructure::quote::codec::{
    ControlKind, Frame, FrameBuffer, FrameCodec, FrameError,
};
use crate::infrastructure::quote::heartbeat::{HeartbeatConfig, HeartbeatState};
use crate::infrastructure::quote::messages::ProtocolMessage;

// =============================================================================
// Error Types
// =============================================================================

/// Failure to establish a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    /// The transport could not be opened.
    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    /// No server hello within the handshake timeout.
    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// The link failed during the handshake.
    #[error("handshake failed: {0}")]
    Handshake(#[from] ConnectionError),
}

/// Failure of an established connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// Socket-level fault.
    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    /// Malformed wire data.
    #[error("frame: {0}")]
    Frame(#[from] FrameError),

    /// The peer closed the stream.
    #[error("end of stream")]
    EndOfStream,

    /// No traffic within the idle timeout.
    #[error("no traffic for {0:?}")]
    IdleTimeout(Duration),

    /// The peer reported a connection-level protocol error.
    #[error("protocol error: {0}")]
    Protocol(String),
}

// =============================================================================
// Connection
// =============================================================================

/// Settings for opening a connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    /// Frame codec limits.
    pub codec: FrameCodec,
    /// Idle watchdog configuration.
    pub heartbeat: HeartbeatConfig,
    /// Time allowed for the server hello.
    pub handshake_timeout: Duration,
}

impl ConnectionSettings {
    /// Create settings from `WebSocketSettings`.
    #[must_use]
    pub const fn from_websocket_settings(settings: &crate::WebSocketSettings) -> Self {
        Self {
            codec: FrameCodec::new(settings.max_frame_bytes),
            heartbeat: HeartbeatConfig::from_websocket_settings(settings),
            handshake_timeout: settings.handshake_timeout,
        }
    }
}

/// One established connection to the quoting service.
pub struct Connection {
    transport: Box<dyn Transport>,
    buffer: FrameBuffer,
    codec: FrameCodec,
    heartbeat_config: HeartbeatConfig,
    heartbeat: Arc<HeartbeatState>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("buffered", &self.buffer.len())
            .field("codec", &self.codec)
            .field("heartbeat_config", &self.heartbeat_config)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Open a connection and complete the handshake.
    ///
    /// `heartbeat` is reset and then updated for the life of the connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport cannot be opened, the server hello
    /// does not arrive in time, or the link fails during the handshake.
    pub async fn open(
        connector: &dyn Connector,
        credential: &Credential,
        settings: ConnectionSettings,
        heartbeat: Arc<HeartbeatState>,
    ) -> Result<Self, ConnectError> {
        let transport = connector.connect().await?;
        heartbeat.reset();

        let mut connection = Self {
            transport,
            buffer: FrameBuffer::new(),
            codec: settings.codec,
            heartbeat_config: settings.heartbeat,
            heartbeat,
        };

        match tokio::time::timeout(settings.handshake_timeout, connection.await_hello()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                connection.close().await;
                return Err(ConnectError::Handshake(e));
            }
            Err(_) => {
                connection.close().await;
                return Err(ConnectError::HandshakeTimeout(settings.handshake_timeout));
            }
        }

        if let Err(e) = connection
            .send(&ProtocolMessage::set_auth_token(credential.token()))
            .await
        {
            connection.close().await;
            return Err(ConnectError::Handshake(e));
        }

        tracing::debug!(anonymous = credential.is_anonymous(), "Handshake complete");
        Ok(connection)
    }

    async fn await_hello(&mut self) -> Result<(), ConnectionError> {
        loop {
            let frame = self.recv().await?;
            let Frame::Control(control) = frame else {
                tracing::debug!("Data frame before server hello ignored");
                continue;
            };
            match control.kind {
                ControlKind::Heartbeat => self.echo_heartbeat(&control.payload).await?,
                ControlKind::ServerHello => return Ok(()),
                ControlKind::CriticalError | ControlKind::ProtocolError => {
                    return Err(ConnectionError::Protocol(
                        control.reason.unwrap_or(control.payload),
                    ));
                }
                other => tracing::debug!(kind = other.as_str(), "Control frame before hello ignored"),
            }
        }
    }

    /// Receive the next frame.
    ///
    /// Heartbeat frames are returned like any other; the caller must echo
    /// them with [`Connection::echo_heartbeat`] before handling further
    /// frames. Cancel-safe: a dropped call loses no buffered data.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure, malformed data, or end of
    /// stream.
    pub async fn recv(&mut self) -> Result<Frame, ConnectionError> {
        loop {
            if let Some(frame) = self.buffer.next_frame(&self.codec)? {
                tracing::trace!(payload = frame.payload(), "Frame received");
                return Ok(frame);
            }

            match self.transport.recv_text().await? {
                Some(text) => {
                    self.heartbeat.record_activity();
                    self.buffer.extend(&text);
                }
                None => return Err(ConnectionError::EndOfStream),
            }
        }
    }

    /// Send a protocol message.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or the transport send fails.
    pub async fn send(&mut self, message: &ProtocolMessage) -> Result<(), ConnectionError> {
        let wire = self.codec.encode_message(message)?;
        tracing::trace!(message = %message.m, "Sending");
        self.transport.send_text(wire).await?;
        Ok(())
    }

    /// Echo a heartbeat payload back to the server.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport send fails.
    pub async fn echo_heartbeat(&mut self, payload: &str) -> Result<(), ConnectionError> {
        self.transport.send_text(self.codec.encode(payload)).await?;
        self.heartbeat.record_echo();
        Ok(())
    }

    /// Instant at which the link is considered dead without further traffic.
    #[must_use]
    pub fn idle_deadline(&self) -> Instant {
        self.heartbeat.idle_deadline(&self.heartbeat_config)
    }

    /// Idle timeout in effect.
    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        self.heartbeat_config.idle_timeout
    }

    /// Close the transport and discard buffered data.
    pub async fn close(&mut self) {
        self.transport.close().await;
        self.buffer.clear();
    }
}

// =============================================================================
// Tests
// =============================================================================
