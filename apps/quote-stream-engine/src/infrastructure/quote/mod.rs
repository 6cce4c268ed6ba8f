//! Quote Stream Adapters
//!
//! Wire-level implementation of the chart quoting protocol:
//!
//! - **Codec**: `~m~<len>~m~` framing, control vs. data classification
//! - **Messages**: client protocol messages (auth, chart sessions)
//! - **Connection**: handshake, frame reassembly, heartbeat echo
//! - **Heartbeat / Reconnect**: idle watchdog and backoff policy
//! - **WebSocket**: `tokio-tungstenite` transport

pub mod codec;
pub mod connection;
pub mod heartbeat;
pub mod messages;
pub mod reconnect;
pub mod websocket;

pub use codec::{
    ControlFrame, ControlKind, DataFrame, Decoded, Frame, FrameBuffer, FrameCodec, FrameError,
};
pub use connection::{ConnectError, Connection, ConnectionError, ConnectionSettings};
pub use heartbeat::{HeartbeatConfig, HeartbeatState};
pub use messages::{ProtocolMessage, TradingSession};
pub use reconnect::{ReconnectConfig, ReconnectError, ReconnectPolicy};
pub use websocket::{WebSocketConnector, WebSocketTransport};
