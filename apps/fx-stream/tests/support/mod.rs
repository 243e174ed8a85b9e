//! Scripted transport shared by the integration tests.
//!
//! Every successful `connect` hands the test a [`SessionHandle`] through
//! which it feeds inbound frames and reads what the client sent.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::timeout;

use fx_stream::application::services::{HeartbeatConfig, ReconnectConfig, SessionConfig};
use fx_stream::{
    ConnectionState, GenericAdapter, HealthSnapshot, ProviderSchema, StreamSupervisor,
    SupervisorConfig, TimestampUnit, TransportConnector, TransportError, TransportFrame,
    TransportSession,
};

/// Upper bound on any single wait in a test.
pub const WAIT: Duration = Duration::from_secs(3);

// =============================================================================
// Connector
// =============================================================================

/// Connector whose sessions are driven by the test.
pub struct ScriptedConnector {
    refuse: AtomicBool,
    hang_on_close: AtomicBool,
    connects: AtomicUsize,
    open: Arc<AtomicUsize>,
    max_open: AtomicUsize,
    sessions: mpsc::UnboundedSender<SessionHandle>,
}

impl ScriptedConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<SessionHandle>) {
        let (sessions, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            refuse: AtomicBool::new(false),
            hang_on_close: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
            open: Arc::new(AtomicUsize::new(0)),
            max_open: AtomicUsize::new(0),
            sessions,
        });
        (connector, rx)
    }

    /// Refuse every connection attempt from now on.
    pub fn refuse_all(&self) {
        self.refuse.store(true, Ordering::SeqCst);
    }

    /// Sessions opened from now on never finish a close, like a dead peer.
    pub fn hang_on_close(&self) {
        self.hang_on_close.store(true, Ordering::SeqCst);
    }

    /// Connection attempts so far, refused ones included.
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Sessions currently open.
    pub fn open(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    /// Most sessions ever open at once.
    pub fn max_open(&self) -> usize {
        self.max_open.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportConnector for ScriptedConnector {
    async fn connect(&self, _url: &str) -> Result<Box<dyn TransportSession>, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::Connect("connection refused".to_string()));
        }

        let now_open = self.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_open.fetch_max(now_open, Ordering::SeqCst);

        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let pings = Arc::new(AtomicUsize::new(0));

        let _ = self.sessions.send(SessionHandle {
            frames: frames_tx,
            sent: sent_rx,
            pings: Arc::clone(&pings),
        });

        Ok(Box::new(ScriptedSession {
            frames: frames_rx,
            sent: sent_tx,
            pings,
            open: Arc::clone(&self.open),
            closed: false,
            hang_on_close: self.hang_on_close.load(Ordering::SeqCst),
        }))
    }
}

// =============================================================================
// Session
// =============================================================================

struct ScriptedSession {
    frames: mpsc::UnboundedReceiver<Result<TransportFrame, TransportError>>,
    sent: mpsc::UnboundedSender<String>,
    pings: Arc<AtomicUsize>,
    open: Arc<AtomicUsize>,
    closed: bool,
    hang_on_close: bool,
}

impl ScriptedSession {
    fn release(&mut self) {
        if !self.closed {
            self.closed = true;
            self.open.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for ScriptedSession {
    fn drop(&mut self) {
        self.release();
    }
}

#[async_trait]
impl TransportSession for ScriptedSession {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.sent.send(text).map_err(|_| TransportError::Closed)
    }

    async fn send_ping(&mut self) -> Result<(), TransportError> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn send_pong(&mut self, _payload: Vec<u8>) -> Result<(), TransportError> {
        Ok(())
    }

    async fn next_frame(&mut self) -> Option<Result<TransportFrame, TransportError>> {
        self.frames.recv().await
    }

    async fn close(&mut self) {
        if self.hang_on_close {
            std::future::pending::<()>().await;
        }
        self.release();
    }
}

/// Test side of one scripted session.
pub struct SessionHandle {
    frames: mpsc::UnboundedSender<Result<TransportFrame, TransportError>>,
    sent: mpsc::UnboundedReceiver<String>,
    pings: Arc<AtomicUsize>,
}

impl SessionHandle {
    /// Deliver a JSON text frame to the client.
    pub fn send_json(&self, value: &Value) {
        self.send_text(value.to_string());
    }

    /// Deliver a raw text frame to the client.
    pub fn send_text(&self, text: impl Into<String>) {
        let _ = self.frames.send(Ok(TransportFrame::Text(text.into())));
    }

    /// Close the session from the provider side.
    pub fn close(&self) {
        let _ = self.frames.send(Ok(TransportFrame::Close(None)));
    }

    /// Next message the client sent, parsed as JSON.
    pub async fn next_sent(&mut self) -> Value {
        let text = timeout(WAIT, self.sent.recv())
            .await
            .expect("client sent nothing in time")
            .expect("session dropped");
        serde_json::from_str(&text).unwrap()
    }

    /// True if the client has sent nothing further.
    pub fn nothing_sent(&mut self) -> bool {
        self.sent.try_recv().is_err()
    }

    /// Pings the client sent on this session.
    pub fn pings(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }
}

/// Wait for the next session the client opens.
pub async fn next_session(sessions: &mut mpsc::UnboundedReceiver<SessionHandle>) -> SessionHandle {
    timeout(WAIT, sessions.recv())
        .await
        .expect("no connection attempt in time")
        .expect("connector dropped")
}

// =============================================================================
// Fixtures
// =============================================================================

/// Adapter speaking the generic typed JSON protocol.
pub fn replay_adapter() -> Arc<GenericAdapter> {
    Arc::new(GenericAdapter::new(
        "replay",
        "ws://scripted.invalid/feed",
        ProviderSchema::new("pair", "bid", "ask", "ts", TimestampUnit::Rfc3339),
    ))
}

/// Supervisor configuration with short timers.
pub fn fast_config(pairs: &[&str]) -> SupervisorConfig {
    SupervisorConfig {
        pairs: pairs.iter().map(|p| p.parse().unwrap()).collect(),
        session: SessionConfig {
            subscription_timeout: Duration::from_millis(300),
            heartbeat: HeartbeatConfig::new(Duration::from_millis(100), Duration::from_millis(400)),
            reconnect: ReconnectConfig {
                initial_delay: Duration::from_millis(30),
                max_delay: Duration::from_millis(120),
                multiplier: 2.0,
                jitter_factor: 0.1,
                max_attempts: 0,
                stable_live: Duration::from_secs(10),
            },
            close_timeout: Duration::from_millis(100),
        },
        shutdown_timeout: Duration::from_secs(2),
        ..SupervisorConfig::default()
    }
}

/// Quote payload in the replay adapter's schema.
pub fn quote(pair: &str, bid: &str, ask: &str, ts: DateTime<Utc>) -> Value {
    json!({
        "pair": pair,
        "bid": bid,
        "ask": ask,
        "ts": ts.to_rfc3339_opts(SecondsFormat::Millis, true),
    })
}

/// Subscription acknowledgment for `channels`.
pub fn ack(channels: &[&str]) -> Value {
    json!({"type": "subscribed", "channels": channels})
}

/// Subscribe request the client is expected to send.
pub fn subscribe_request(channels: &[&str]) -> Value {
    json!({"type": "subscribe", "channels": channels})
}

/// Wait until every scripted session has been closed or dropped.
pub async fn wait_for_no_open_sessions(connector: &ScriptedConnector) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while connector.open() > 0 {
        assert!(tokio::time::Instant::now() < deadline, "a session stayed open");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait until the connection reaches `state`.
pub async fn wait_for_state(supervisor: &StreamSupervisor, state: ConnectionState) {
    let mut rx = supervisor.monitor().subscribe_state();
    timeout(WAIT, rx.wait_for(|s| *s == state))
        .await
        .unwrap_or_else(|_| panic!("connection never reached {state}"))
        .unwrap();
}

/// Poll the health snapshot until `check` holds.
pub async fn eventually<F>(supervisor: &StreamSupervisor, what: &str, check: F) -> HealthSnapshot
where
    F: Fn(&HealthSnapshot) -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let snapshot = supervisor.health();
        if check(&snapshot) {
            return snapshot;
        }
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
