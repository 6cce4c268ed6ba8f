//! Port Interfaces
//!
//! Defines the interfaces (ports) for external systems following
//! the Hexagonal Architecture pattern. These are the contracts that
//! infrastructure adapters must implement.
//!
//! ## Driven Ports (Outbound)
//!
//! - `Connector`: Opens a new text transport to the quoting service
//! - `Transport`: One open, bidirectional text message channel

use async_trait::async_trait;

/// Transport-level failures.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The connection could not be established.
    #[error("connect failed: {0}")]
    Connect(String),

    /// Socket-level I/O fault.
    #[error("transport I/O error: {0}")]
    Io(String),

    /// The operation did not complete in time.
    #[error("transport timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The transport was closed.
    #[error("transport closed")]
    Closed,
}

/// One open text message channel to the quoting service.
///
/// Implementations are driven from a single task; no concurrent calls are
/// made on the same transport.
#[async_trait]
pub trait Transport: Send {
    /// Send one text message.
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;

    /// Receive the next text message.
    ///
    /// Returns `Ok(None)` at end of stream. Must be cancel-safe: dropping the
    /// future before completion loses no data.
    async fn recv_text(&mut self) -> Result<Option<String>, TransportError>;

    /// Close the transport. Errors are not reported.
    async fn close(&mut self);
}

/// Factory for transports; called once per connection attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a fresh transport.
    async fn connect(&self) -> Result<Box<dyn Transport>, TransportError>;
}
