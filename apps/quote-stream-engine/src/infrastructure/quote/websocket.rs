//! WebSocket Transport
//!
//! [`Connector`] and [`Transport`] implementations over `tokio-tungstenite`
//! with rustls. The quoting service requires an `Origin` header on the
//! upgrade request.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::ORIGIN;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::application::ports::{Connector, Transport, TransportError};

/// Opens WebSocket connections to the quoting service.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
    origin: String,
    connect_timeout: Duration,
}

impl WebSocketConnector {
    /// Create a connector for `url`, sending `origin` on the upgrade request.
    #[must_use]
    pub fn new(url: impl Into<String>, origin: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            origin: origin.into(),
            connect_timeout,
        }
    }

    /// Create a connector from `WebSocketSettings`.
    #[must_use]
    pub fn from_settings(settings: &crate::WebSocketSettings) -> Self {
        Self::new(
            settings.endpoint.clone(),
            settings.origin.clone(),
            settings.connect_timeout,
        )
    }

    /// Target URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>, TransportError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let origin = HeaderValue::from_str(&self.origin)
            .map_err(|e| TransportError::Connect(format!("invalid origin: {e}")))?;
        request.headers_mut().insert(ORIGIN, origin);

        let (stream, response) =
            tokio::time::timeout(self.connect_timeout, tokio_tungstenite::connect_async(request))
                .await
                .map_err(|_| TransportError::Timeout(self.connect_timeout))?
                .map_err(|e| TransportError::Connect(e.to_string()))?;

        tracing::debug!(url = %self.url, status = %response.status(), "WebSocket upgraded");
        Ok(Box::new(WebSocketTransport { stream }))
    }
}

/// One WebSocket connection.
pub struct WebSocketTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.stream
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn recv_text(&mut self) -> Result<Option<String>, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text.as_str().to_owned())),
                Some(Ok(Message::Binary(data))) => {
                    return String::from_utf8(data.to_vec())
                        .map(Some)
                        .map_err(|e| TransportError::Io(format!("non UTF-8 binary message: {e}")));
                }
                Some(Ok(Message::Close(frame))) => {
                    tracing::debug!(?frame, "WebSocket closed by server");
                    return Ok(None);
                }
                // Control frames are answered by tungstenite itself
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                Some(Err(e)) => return Err(TransportError::Io(e.to_string())),
                None => return Ok(None),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            tracing::debug!(error = %e, "WebSocket close failed");
        }
    }
}
