//! Port Interfaces
//!
//! Contracts between the connection logic and the outside world, following
//! the Hexagonal Architecture pattern. Infrastructure adapters implement
//! these traits; the application services depend only on them.
//!
//! ## Driven Ports (Outbound)
//!
//! - [`ProviderAdapter`]: one market-data provider's wire protocol
//! - [`TransportConnector`] / [`TransportSession`]: a text-frame WebSocket
//!
//! ## Driver Ports (Inbound)
//!
//! - [`TickSink`]: consumer callback receiving delivered ticks

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::normalizer::ProviderSchema;
use crate::domain::subscription::{ChannelId, ChannelNaming};
use crate::domain::tick::Tick;

// =============================================================================
// Provider Adapter
// =============================================================================

/// A decoded provider message.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    /// Provider greeted the new connection.
    Connected,
    /// Credentials accepted.
    Authenticated,
    /// Credentials rejected.
    AuthFailed(String),
    /// Subscription request acknowledged.
    SubscribeAck {
        /// Channels or symbols confirmed.
        succeeded: Vec<String>,
        /// Channels or symbols refused.
        failed: Vec<String>,
    },
    /// Application-level heartbeat.
    Heartbeat,
    /// Price payload for the normalizer.
    Quote(Value),
    /// Provider-reported error.
    Error(String),
    /// Recognized but irrelevant message.
    Ignored,
}

/// Errors decoding provider frames.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON encoding/decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid message format.
    #[error("invalid message format: {0}")]
    InvalidFormat(String),
}

/// One market-data provider's wire protocol.
///
/// Selected by configuration at startup. The connection logic depends only
/// on this capability set, never on a provider's concrete types.
pub trait ProviderAdapter: ChannelNaming + Send + Sync {
    /// Short provider name for logs and metrics.
    fn name(&self) -> &'static str;

    /// WebSocket URL to connect to.
    fn endpoint_url(&self) -> String;

    /// Message to send right after connecting, if the provider needs one.
    fn auth_message(&self) -> Option<String> {
        None
    }

    /// True if subscriptions must wait for [`ProviderEvent::Authenticated`].
    fn subscribe_after_auth(&self) -> bool {
        false
    }

    /// Decode one text frame.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] if the frame is not valid for this provider.
    fn parse(&self, text: &str) -> Result<Vec<ProviderEvent>, CodecError>;

    /// Field mapping for quote payloads.
    fn schema(&self) -> &ProviderSchema;

    /// Subscribe request for `channels`, or `None` when empty.
    fn subscribe_message(&self, channels: &BTreeSet<ChannelId>) -> Option<String>;

    /// Unsubscribe request for `channels`, or `None` when empty.
    fn unsubscribe_message(&self, channels: &BTreeSet<ChannelId>) -> Option<String>;
}

// =============================================================================
// Transport
// =============================================================================

/// An inbound transport frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportFrame {
    /// Text frame.
    Text(String),
    /// Binary frame.
    Binary(Vec<u8>),
    /// Ping from the peer; must be answered with a pong.
    Ping(Vec<u8>),
    /// Pong from the peer.
    Pong,
    /// Peer is closing the connection.
    Close(Option<String>),
}

/// Transport failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Could not open the connection.
    #[error("connection failed: {0}")]
    Connect(String),
    /// Read or write failed on an open connection.
    #[error("transport I/O error: {0}")]
    Io(String),
    /// The connection is already closed.
    #[error("connection closed")]
    Closed,
}

/// Opens transport sessions.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    /// Open a session to `url`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Connect`] if the connection cannot be
    /// established.
    async fn connect(&self, url: &str) -> Result<Box<dyn TransportSession>, TransportError>;
}

/// One open transport session.
///
/// `next_frame` must be cancel-safe: it is polled inside `select!`.
#[async_trait]
pub trait TransportSession: Send {
    /// Send a text frame.
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;

    /// Send a ping frame.
    async fn send_ping(&mut self) -> Result<(), TransportError>;

    /// Answer a peer ping.
    async fn send_pong(&mut self, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Next inbound frame; `None` when the stream ended.
    async fn next_frame(&mut self) -> Option<Result<TransportFrame, TransportError>>;

    /// Close the session. Errors are ignored.
    async fn close(&mut self);
}

// =============================================================================
// Tick Sink
// =============================================================================

/// Consumer callback for delivered ticks.
///
/// Runs on a dedicated blocking thread and may block freely.
pub trait TickSink: Send + 'static {
    /// Handle one tick.
    fn on_tick(&mut self, tick: Tick);

    /// Called once after the last tick, when the stream stops.
    fn on_close(&mut self) {}
}

impl<F> TickSink for F
where
    F: FnMut(Tick) + Send + 'static,
{
    fn on_tick(&mut self, tick: Tick) {
        self(tick);
    }
}
