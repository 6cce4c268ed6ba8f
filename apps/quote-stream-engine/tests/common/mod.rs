//! Shared fixtures: an in-memory quoting server and recording consumers.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use quote_stream_engine::infrastructure::quote::FrameCodec;
use quote_stream_engine::{
    Connector, Consumer, ConsumerError, EngineConfig, SubscriptionError, Transport,
    TransportError, Update,
};
use serde_json::{Value, json};
use tokio::sync::mpsc;

/// How long any single expectation may wait.
pub const WAIT: Duration = Duration::from_secs(5);

// =============================================================================
// Configuration
// =============================================================================

/// Engine configuration with fast backoff for tests.
pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.websocket.reconnect_delay_initial = Duration::from_millis(10);
    config.websocket.reconnect_delay_max = Duration::from_millis(80);
    config.websocket.handshake_timeout = Duration::from_secs(2);
    config
}

// =============================================================================
// Mock Connector
// =============================================================================

/// Connector whose transports are driven by a [`MockServer`].
pub struct MockConnector {
    accepted: mpsc::UnboundedSender<ServerConn>,
    failures_left: AtomicU32,
    refuse_all: AtomicBool,
    attempts: AtomicU32,
}

impl MockConnector {
    /// Fail the next `n` connection attempts.
    pub fn fail_next(&self, n: u32) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    /// Fail every connection attempt from now on.
    pub fn refuse_all(&self) {
        self.refuse_all.store(true, Ordering::SeqCst);
    }

    /// Connection attempts made so far.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        if self.refuse_all.load(Ordering::SeqCst) {
            return Err(TransportError::Connect("refused".to_string()));
        }
        let consumed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if consumed {
            return Err(TransportError::Connect("injected failure".to_string()));
        }

        let (to_client, incoming) = mpsc::unbounded_channel();
        let (outgoing, from_client) = mpsc::unbounded_channel();
        self.accepted
            .send(ServerConn {
                to_client: Some(to_client),
                from_client,
            })
            .map_err(|_| TransportError::Connect("server gone".to_string()))?;

        Ok(Box::new(MockTransport { incoming, outgoing }))
    }
}

struct MockTransport {
    incoming: mpsc::UnboundedReceiver<String>,
    outgoing: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.outgoing.send(text).map_err(|_| TransportError::Closed)
    }

    async fn recv_text(&mut self) -> Result<Option<String>, TransportError> {
        Ok(self.incoming.recv().await)
    }

    async fn close(&mut self) {
        self.incoming.close();
    }
}

// =============================================================================
// Mock Server
// =============================================================================

/// Receives the server side of each accepted connection.
pub struct MockServer {
    incoming: mpsc::UnboundedReceiver<ServerConn>,
}

/// Create a connected connector/server pair.
pub fn mock_server() -> (Arc<MockConnector>, MockServer) {
    let (accepted, incoming) = mpsc::unbounded_channel();
    let connector = Arc::new(MockConnector {
        accepted,
        failures_left: AtomicU32::new(0),
        refuse_all: AtomicBool::new(false),
        attempts: AtomicU32::new(0),
    });
    (connector, MockServer { incoming })
}

impl MockServer {
    /// Wait for the next connection.
    pub async fn accept(&mut self) -> ServerConn {
        tokio::time::timeout(WAIT, self.incoming.recv())
            .await
            .expect("no connection within timeout")
            .expect("connector dropped")
    }

    /// Accept a connection and complete the handshake.
    pub async fn accept_ready(&mut self) -> ServerConn {
        let mut conn = self.accept().await;
        conn.send_hello();
        let auth = conn.expect("set_auth_token").await;
        assert_eq!(auth, vec![json!("unauthorized_user_token")]);
        conn
    }
}

/// Server side of one connection.
pub struct ServerConn {
    to_client: Option<mpsc::UnboundedSender<String>>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl ServerConn {
    /// Send one framed payload.
    pub fn send_payload(&self, payload: &str) {
        if let Some(tx) = &self.to_client {
            let _ = tx.send(FrameCodec::default().encode(payload));
        }
    }

    /// Send raw bytes with no framing.
    pub fn send_raw(&self, text: &str) {
        if let Some(tx) = &self.to_client {
            let _ = tx.send(text.to_string());
        }
    }

    /// Send the server hello.
    pub fn send_hello(&self) {
        self.send_payload(r#"{"session_id":"<0.1.2>_test","timestamp":1700000000}"#);
    }

    /// Send a protocol message.
    pub fn send_message(&self, name: &str, params: &Value) {
        self.send_payload(&json!({ "m": name, "p": params }).to_string());
    }

    /// Send one bar on `session`.
    pub fn send_bar(&self, session: &str, time: i64, close: f64) {
        let bar = json!([time, close - 1.0, close + 1.0, close - 2.0, close, 10.5]);
        self.send_message(
            "du",
            &json!([session, { "sds_1": { "s": [{ "i": 0, "v": bar }] } }]),
        );
    }

    /// Send an initial series load of `(time, close)` bars on `session`.
    pub fn send_history(&self, session: &str, bars: &[(i64, f64)]) {
        let series: Vec<Value> = bars
            .iter()
            .enumerate()
            .map(|(i, &(time, close))| {
                json!({ "i": i, "v": [time, close - 1.0, close + 1.0, close - 2.0, close, 10.5] })
            })
            .collect();
        self.send_message(
            "timescale_update",
            &json!([session, { "sds_1": { "s": series } }]),
        );
    }

    /// Acknowledge a session as the server would.
    pub fn confirm(&self, session: &str) {
        self.send_message(
            "symbol_resolved",
            &json!([session, "sds_sym_1", { "name": "TEST" }]),
        );
        self.send_message("series_completed", &json!([session, "sds_1", "streaming"]));
    }

    /// Next client payload with framing removed.
    pub async fn next_payload(&mut self) -> String {
        let text = tokio::time::timeout(WAIT, self.from_client.recv())
            .await
            .expect("client sent nothing within timeout")
            .expect("client disconnected");
        unframe(&text)
    }

    /// Next non-heartbeat client message; asserts its name and returns params.
    pub async fn expect(&mut self, name: &str) -> Vec<Value> {
        loop {
            let payload = self.next_payload().await;
            if payload.starts_with("~h~") {
                continue;
            }
            let value: Value = serde_json::from_str(&payload).expect("client sent invalid JSON");
            assert_eq!(value["m"], name, "unexpected message {payload}");
            return value["p"].as_array().cloned().unwrap_or_default();
        }
    }

    /// Read the three messages that open a chart session; returns its id.
    pub async fn expect_session(&mut self) -> String {
        let create = self.expect("chart_create_session").await;
        let session = create[0].as_str().expect("session id").to_string();
        let resolve = self.expect("resolve_symbol").await;
        assert_eq!(resolve[0], session.as_str());
        let series = self.expect("create_series").await;
        assert_eq!(series[0], session.as_str());
        session
    }

    /// Assert the client sends nothing (heartbeats aside) for `duration`.
    pub async fn expect_silence(&mut self, duration: Duration) {
        let deadline = tokio::time::Instant::now() + duration;
        loop {
            match tokio::time::timeout_at(deadline, self.from_client.recv()).await {
                Err(_) | Ok(None) => return,
                Ok(Some(text)) => {
                    let payload = unframe(&text);
                    assert!(payload.starts_with("~h~"), "unexpected message {payload}");
                }
            }
        }
    }

    /// End the stream from the server side.
    pub fn hang_up(&mut self) {
        self.to_client = None;
    }
}

fn unframe(text: &str) -> String {
    let rest = text.strip_prefix("~m~").expect("missing frame marker");
    let (len, payload) = rest.split_once("~m~").expect("missing length terminator");
    let len: usize = len.parse().expect("bad length");
    assert_eq!(payload.len(), len, "length prefix mismatch");
    payload.to_string()
}

// =============================================================================
// Recording Consumer
// =============================================================================

/// Consumer that records everything it sees.
#[derive(Default)]
pub struct Recorder {
    updates: Mutex<Vec<Update>>,
    errors: Mutex<Vec<SubscriptionError>>,
    closed: AtomicBool,
    fail_first: AtomicBool,
}

impl Recorder {
    /// A recorder that returns an error for its first update.
    pub fn failing_once() -> Self {
        let recorder = Self::default();
        recorder.fail_first.store(true, Ordering::SeqCst);
        recorder
    }

    pub fn updates(&self) -> Vec<Update> {
        self.updates.lock().clone()
    }

    pub fn closes(&self) -> Vec<String> {
        self.updates()
            .iter()
            .map(|u| u.bar.close.to_string())
            .collect()
    }

    pub fn errors(&self) -> Vec<SubscriptionError> {
        self.errors.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Consumer for Recorder {
    fn on_update(&self, update: &Update) -> Result<(), ConsumerError> {
        self.updates.lock().push(update.clone());
        if self.fail_first.swap(false, Ordering::SeqCst) {
            return Err(anyhow::anyhow!("first update rejected").into());
        }
        Ok(())
    }

    fn on_error(&self, error: &SubscriptionError) {
        self.errors.lock().push(error.clone());
    }

    fn on_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Poll `condition` until it holds or [`WAIT`] elapses.
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let polled = tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for {what}");
}
