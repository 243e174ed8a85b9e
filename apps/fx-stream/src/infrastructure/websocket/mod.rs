//! WebSocket Transport
//!
//! [`TransportConnector`] over `tokio-tungstenite` with rustls. Frames are
//! mapped onto [`TransportFrame`]; reads go through `StreamExt::next`, which
//! is cancel-safe, so the session loop can poll it inside `select!`.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::application::ports::{
    TransportConnector, TransportError, TransportFrame, TransportSession,
};

/// Default upper bound on the TCP + TLS + upgrade handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Opens WebSocket sessions.
#[derive(Debug, Clone)]
pub struct WsConnector {
    connect_timeout: Duration,
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

impl WsConnector {
    /// Create a connector with the given handshake timeout.
    #[must_use]
    pub const fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl TransportConnector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn TransportSession>, TransportError> {
        let handshake = tokio_tungstenite::connect_async(url);
        let (stream, response) = tokio::time::timeout(self.connect_timeout, handshake)
            .await
            .map_err(|_| {
                TransportError::Connect(format!(
                    "handshake timed out after {}ms",
                    self.connect_timeout.as_millis()
                ))
            })?
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        tracing::debug!(status = %response.status(), "WebSocket handshake complete");
        Ok(Box::new(WsSession { stream }))
    }
}

/// One open WebSocket connection.
pub struct WsSession {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WsSession {
    async fn send(&mut self, message: Message) -> Result<(), TransportError> {
        self.stream.send(message).await.map_err(map_error)
    }
}

fn map_error(error: tungstenite::Error) -> TransportError {
    match error {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            TransportError::Closed
        }
        other => TransportError::Io(other.to_string()),
    }
}

fn map_message(message: Message) -> Option<TransportFrame> {
    match message {
        Message::Text(text) => Some(TransportFrame::Text(text.to_string())),
        Message::Binary(data) => Some(TransportFrame::Binary(data.to_vec())),
        Message::Ping(data) => Some(TransportFrame::Ping(data.to_vec())),
        Message::Pong(_) => Some(TransportFrame::Pong),
        Message::Close(frame) => Some(TransportFrame::Close(
            frame.map(|f| format!("{} {}", u16::from(f.code), f.reason.as_str())),
        )),
        Message::Frame(_) => None,
    }
}

#[async_trait]
impl TransportSession for WsSession {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.send(Message::Text(text.into())).await
    }

    async fn send_ping(&mut self) -> Result<(), TransportError> {
        self.send(Message::Ping(Vec::new().into())).await
    }

    async fn send_pong(&mut self, payload: Vec<u8>) -> Result<(), TransportError> {
        self.send(Message::Pong(payload.into())).await
    }

    async fn next_frame(&mut self) -> Option<Result<TransportFrame, TransportError>> {
        loop {
            match self.stream.next().await? {
                Ok(message) => {
                    if let Some(frame) = map_message(message) {
                        return Some(Ok(frame));
                    }
                }
                Err(e) => return Some(Err(map_error(e))),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            tracing::debug!(error = %e, "Error while closing WebSocket");
        }
    }
}
