//! Reconnection Manager
//!
//! Owns the provider session lifecycle:
//!
//! - Opens the transport, authenticates and subscribes
//! - Feeds quotes through the normalizer into the tick fan-out
//! - Detects subscription timeouts, staleness and transport failures
//! - Reconnects with exponential backoff until shut down
//!
//! # Guarantees
//!
//! At most one transport session is open at a time: the session is closed,
//! or dropped once the close timeout elapses, before the backoff delay
//! starts. The state moves to Backoff as soon as the failure is detected,
//! independent of how long the close takes. The manager tracks which channels are
//! subscribed on the current session and only ever sends the difference
//! between that set and the multiplexer's, so a channel is never subscribed
//! twice on one session.
//!
//! # Timers
//!
//! Timers carry the [`TimerTag`] of the state they were armed in. A timer
//! that fires after the state machine moved on is ignored.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::heartbeat::{
    HeartbeatConfig, HeartbeatEvent, HeartbeatEventKind, HeartbeatManager, LivenessState,
};
use super::monitor::ConnectionMonitor;
use super::reconnect::{ReconnectConfig, ReconnectError, ReconnectPolicy};
use crate::application::ports::{
    ProviderAdapter, ProviderEvent, TransportConnector, TransportError, TransportFrame,
    TransportSession,
};
use crate::domain::buffer::TickFanout;
use crate::domain::connection::{
    ConnectionState, ConnectionStateMachine, TimerTag, TransitionReason,
};
use crate::domain::normalizer::TickNormalizer;
use crate::domain::subscription::{ChannelId, SubscriptionChanges, SubscriptionMultiplexer};
use crate::infrastructure::metrics;

// =============================================================================
// Configuration
// =============================================================================

/// Timing configuration for the reconnection manager.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Maximum wait for a subscription acknowledgment or first tick.
    pub subscription_timeout: Duration,
    /// Ping interval and staleness timeout.
    pub heartbeat: HeartbeatConfig,
    /// Backoff policy.
    pub reconnect: ReconnectConfig,
    /// Wait for a transport close before dropping the session.
    pub close_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            subscription_timeout: Duration::from_secs(10),
            heartbeat: HeartbeatConfig::default(),
            reconnect: ReconnectConfig::default(),
            close_timeout: Duration::from_secs(2),
        }
    }
}

/// Collaborators shared between the manager and its supervisor.
#[derive(Clone)]
pub struct SessionContext {
    /// Provider wire protocol.
    pub adapter: Arc<dyn ProviderAdapter>,
    /// Transport factory.
    pub connector: Arc<dyn TransportConnector>,
    /// Active pair set.
    pub multiplexer: Arc<SubscriptionMultiplexer>,
    /// Consumer buffers.
    pub fanout: Arc<TickFanout>,
    /// Health state.
    pub monitor: Arc<ConnectionMonitor>,
    /// Signalled when the pair set changes.
    pub resync: Arc<Notify>,
}

// =============================================================================
// Timers
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct Deadline {
    at: Instant,
    tag: TimerTag,
}

impl Deadline {
    fn after(delay: Duration, tag: TimerTag) -> Self {
        Self {
            at: Instant::now() + delay,
            tag,
        }
    }
}

async fn expire(deadline: Option<Deadline>) -> TimerTag {
    match deadline {
        Some(d) => {
            tokio::time::sleep_until(d.at).await;
            d.tag
        }
        None => std::future::pending().await,
    }
}

// =============================================================================
// Per-Session State
// =============================================================================

struct LiveSession {
    transport: Box<dyn TransportSession>,
    subscribed: BTreeSet<ChannelId>,
    awaiting_auth: bool,
    subscription_deadline: Option<Deadline>,
    liveness: Arc<LivenessState>,
    heartbeat_tx: mpsc::Sender<HeartbeatEvent>,
    heartbeat_rx: mpsc::Receiver<HeartbeatEvent>,
    heartbeat_cancel: Option<CancellationToken>,
}

impl LiveSession {
    fn new(transport: Box<dyn TransportSession>) -> Self {
        let (heartbeat_tx, heartbeat_rx) = mpsc::channel(16);
        Self {
            transport,
            subscribed: BTreeSet::new(),
            awaiting_auth: false,
            subscription_deadline: None,
            liveness: Arc::new(LivenessState::new()),
            heartbeat_tx,
            heartbeat_rx,
            heartbeat_cancel: None,
        }
    }

    fn stop_heartbeat(&mut self) {
        if let Some(cancel) = self.heartbeat_cancel.take() {
            cancel.cancel();
        }
    }
}

/// What processing a frame asks the loop to do.
enum Flow {
    Continue,
    End(TransitionReason),
}

// =============================================================================
// Reconnection Manager
// =============================================================================

/// Connection task. Owns the normalizer and the state machine.
pub struct ReconnectionManager {
    config: SessionConfig,
    ctx: SessionContext,
    cancel: CancellationToken,
    normalizer: TickNormalizer,
    machine: ConnectionStateMachine,
    policy: ReconnectPolicy,
}

impl ReconnectionManager {
    /// Create a manager. Nothing happens until [`ReconnectionManager::run`].
    #[must_use]
    pub fn new(
        config: SessionConfig,
        ctx: SessionContext,
        normalizer: TickNormalizer,
        cancel: CancellationToken,
    ) -> Self {
        let policy = ReconnectPolicy::new(config.reconnect.clone());
        Self {
            config,
            ctx,
            cancel,
            normalizer,
            machine: ConnectionStateMachine::new(),
            policy,
        }
    }

    /// Run until cancelled, until reconnect attempts are exhausted or until
    /// the provider rejects the credentials.
    ///
    /// Returns the normalizer so sequence numbering survives a restart.
    pub async fn run(mut self) -> TickNormalizer {
        self.transition(ConnectionState::Connecting, TransitionReason::Start);

        loop {
            let url = self.ctx.adapter.endpoint_url();
            tracing::info!(provider = self.ctx.adapter.name(), "Connecting to provider");

            let connected = tokio::select! {
                () = self.cancel.cancelled() => break,
                result = self.ctx.connector.connect(&url) => result,
            };

            match connected {
                Ok(transport) => {
                    self.transition(ConnectionState::Subscribing, TransitionReason::TransportConnected);
                    self.ctx.monitor.set_session(self.machine.session());
                    match self.drive(transport).await {
                        TransitionReason::Shutdown => break,
                        TransitionReason::AuthenticationFailed => return self.normalizer,
                        _ => {}
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Provider connection failed");
                    self.ctx.monitor.set_error(e.to_string());
                    self.transition(ConnectionState::Backoff, TransitionReason::TransportError);
                }
            }

            let Some(delay) = self.policy.next_delay() else {
                let error = ReconnectError::MaxAttemptsExceeded(self.policy.max_attempts());
                tracing::error!(error = %error, "Giving up on provider connection");
                self.ctx.monitor.set_error(error.to_string());
                self.transition(ConnectionState::Disconnected, TransitionReason::RetriesExhausted);
                return self.normalizer;
            };
            self.ctx.monitor.set_reconnect_attempts(self.policy.attempt_count());
            tracing::info!(
                attempt = self.policy.attempt_count(),
                delay_ms = delay.as_millis(),
                "Reconnecting to provider"
            );

            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
            self.transition(ConnectionState::Connecting, TransitionReason::BackoffElapsed);
        }

        self.transition(ConnectionState::Disconnected, TransitionReason::Shutdown);
        self.normalizer
    }

    /// Drive one transport session until it ends.
    ///
    /// Records the resulting transition before closing the transport, so a
    /// peer that never answers the close cannot hold the state at Live.
    /// Shutdown leaves the final transition to [`ReconnectionManager::run`].
    async fn drive(&mut self, transport: Box<dyn TransportSession>) -> TransitionReason {
        let mut session = LiveSession::new(transport);
        let reason = self.drive_session(&mut session).await;

        session.stop_heartbeat();
        if self.machine.state() == ConnectionState::Live {
            self.policy.mark_disconnected(Instant::now());
        }

        match reason {
            TransitionReason::Shutdown => {}
            TransitionReason::AuthenticationFailed => {
                tracing::error!(
                    provider = self.ctx.adapter.name(),
                    "Provider rejected credentials, not reconnecting"
                );
                self.transition(ConnectionState::Disconnected, reason);
            }
            _ => {
                tracing::warn!(reason = %reason, "Provider session ended");
                self.transition(ConnectionState::Backoff, reason);
            }
        }

        self.close_transport(session).await;
        reason
    }

    /// Close the transport, dropping it if the close does not finish within
    /// the close timeout.
    async fn close_transport(&self, mut session: LiveSession) {
        let timeout = self.config.close_timeout;
        if tokio::time::timeout(timeout, session.transport.close())
            .await
            .is_err()
        {
            tracing::warn!(
                timeout_ms = timeout.as_millis(),
                "Transport close timed out, dropping session"
            );
            metrics::record_close_timeout(self.ctx.adapter.name());
        }
    }

    async fn drive_session(&mut self, session: &mut LiveSession) -> TransitionReason {
        if let Flow::End(reason) = self.open_session(session).await {
            return reason;
        }

        loop {
            let flow = tokio::select! {
                biased;
                () = self.cancel.cancelled() => Flow::End(TransitionReason::Shutdown),
                tag = expire(session.subscription_deadline) => {
                    session.subscription_deadline = None;
                    if self.machine.is_current(tag) && self.machine.state() == ConnectionState::Subscribing {
                        tracing::warn!(
                            timeout_ms = self.config.subscription_timeout.as_millis(),
                            "Subscription not acknowledged in time"
                        );
                        Flow::End(TransitionReason::SubscriptionTimeout)
                    } else {
                        Flow::Continue
                    }
                }
                Some(event) = session.heartbeat_rx.recv() => self.on_heartbeat(session, event).await,
                () = self.ctx.resync.notified() => self.on_resync(session).await,
                frame = session.transport.next_frame() => self.on_frame(session, frame).await,
            };

            if let Flow::End(reason) = flow {
                return reason;
            }
        }
    }

    /// Authenticate, subscribe and arm the subscription timer.
    async fn open_session(&mut self, session: &mut LiveSession) -> Flow {
        session.liveness.reset();

        if let Some(auth) = self.ctx.adapter.auth_message() {
            if let Err(e) = session.transport.send_text(auth).await {
                return self.transport_failed(&e);
            }
            session.awaiting_auth = self.ctx.adapter.subscribe_after_auth();
        }

        if !session.awaiting_auth {
            if let Flow::End(reason) = self.sync_subscriptions(session).await {
                return Flow::End(reason);
            }
            if session.subscribed.is_empty() {
                self.go_live(session, TransitionReason::NothingToSubscribe);
                return Flow::Continue;
            }
        }

        session.subscription_deadline = Some(Deadline::after(
            self.config.subscription_timeout,
            self.machine.timer_tag(),
        ));
        Flow::Continue
    }

    /// Send the difference between the session's channels and the
    /// multiplexer's.
    async fn sync_subscriptions(&mut self, session: &mut LiveSession) -> Flow {
        let desired = self.ctx.multiplexer.channels();
        let changes = SubscriptionChanges::between(&session.subscribed, &desired);
        metrics::set_subscribed_pairs(self.ctx.multiplexer.len());
        if changes.is_empty() {
            return Flow::Continue;
        }

        if let Some(message) = self.ctx.adapter.unsubscribe_message(&changes.unsubscribe) {
            tracing::info!(channels = ?changes.unsubscribe, "Unsubscribing");
            if let Err(e) = session.transport.send_text(message).await {
                return self.transport_failed(&e);
            }
            for channel in &changes.unsubscribe {
                session.subscribed.remove(channel);
            }
        }

        if let Some(message) = self.ctx.adapter.subscribe_message(&changes.subscribe) {
            tracing::info!(channels = ?changes.subscribe, "Subscribing");
            if let Err(e) = session.transport.send_text(message).await {
                return self.transport_failed(&e);
            }
            session.subscribed.extend(changes.subscribe);
        }

        Flow::Continue
    }

    async fn on_resync(&mut self, session: &mut LiveSession) -> Flow {
        if session.awaiting_auth {
            return Flow::Continue;
        }
        if let Flow::End(reason) = self.sync_subscriptions(session).await {
            return Flow::End(reason);
        }
        if self.machine.state() == ConnectionState::Subscribing && session.subscribed.is_empty() {
            self.go_live(session, TransitionReason::NothingToSubscribe);
        }
        Flow::Continue
    }

    async fn on_heartbeat(&mut self, session: &mut LiveSession, event: HeartbeatEvent) -> Flow {
        if !self.machine.is_current(event.tag) {
            tracing::trace!(generation = event.tag.generation(), "Ignoring stale heartbeat event");
            return Flow::Continue;
        }
        match event.kind {
            HeartbeatEventKind::SendPing => match session.transport.send_ping().await {
                Ok(()) => Flow::Continue,
                Err(e) => self.transport_failed(&e),
            },
            HeartbeatEventKind::Stale { silent_for } => {
                self.ctx.monitor.set_error(format!(
                    "no message for {}ms",
                    silent_for.as_millis()
                ));
                Flow::End(TransitionReason::StalenessTimeout)
            }
        }
    }

    async fn on_frame(
        &mut self,
        session: &mut LiveSession,
        frame: Option<Result<TransportFrame, TransportError>>,
    ) -> Flow {
        let frame = match frame {
            None => return Flow::End(TransitionReason::TransportClosed),
            Some(Err(e)) => return self.transport_failed(&e),
            Some(Ok(frame)) => frame,
        };

        session.liveness.record_activity();
        self.ctx.monitor.record_message();
        metrics::record_message_received(self.ctx.adapter.name());

        match frame {
            TransportFrame::Text(text) => self.on_text(session, &text).await,
            TransportFrame::Ping(payload) => match session.transport.send_pong(payload).await {
                Ok(()) => Flow::Continue,
                Err(e) => self.transport_failed(&e),
            },
            TransportFrame::Pong => Flow::Continue,
            TransportFrame::Binary(data) => {
                tracing::debug!(len = data.len(), "Ignoring binary frame");
                Flow::Continue
            }
            TransportFrame::Close(reason) => {
                tracing::info!(reason = ?reason, "Provider closed the connection");
                Flow::End(TransitionReason::TransportClosed)
            }
        }
    }

    async fn on_text(&mut self, session: &mut LiveSession, text: &str) -> Flow {
        let started = std::time::Instant::now();
        let events = match self.ctx.adapter.parse(text) {
            Ok(events) => events,
            Err(e) => {
                tracing::debug!(error = %e, "Dropping undecodable frame");
                metrics::record_decode_error(self.ctx.adapter.name());
                return Flow::Continue;
            }
        };

        for event in events {
            match event {
                ProviderEvent::Connected => tracing::debug!("Provider greeted connection"),
                ProviderEvent::Authenticated => {
                    tracing::info!(provider = self.ctx.adapter.name(), "Authenticated");
                    if session.awaiting_auth {
                        session.awaiting_auth = false;
                        if let Flow::End(reason) = self.sync_subscriptions(session).await {
                            return Flow::End(reason);
                        }
                        if session.subscribed.is_empty() {
                            self.go_live(session, TransitionReason::NothingToSubscribe);
                        }
                    }
                }
                ProviderEvent::AuthFailed(message) => {
                    tracing::error!(message = %message, "Provider rejected credentials");
                    self.ctx.monitor.set_error(format!("authentication failed: {message}"));
                    return Flow::End(TransitionReason::AuthenticationFailed);
                }
                ProviderEvent::SubscribeAck { succeeded, failed } => {
                    if !failed.is_empty() {
                        tracing::warn!(failed = ?failed, "Provider refused some channels");
                    }
                    tracing::debug!(succeeded = ?succeeded, "Subscription acknowledged");
                    if self.machine.state() == ConnectionState::Subscribing && !session.awaiting_auth {
                        self.go_live(session, TransitionReason::SubscriptionAcknowledged);
                    }
                }
                ProviderEvent::Heartbeat => tracing::trace!("Provider heartbeat"),
                ProviderEvent::Quote(payload) => self.on_quote(session, &payload),
                ProviderEvent::Error(message) => {
                    tracing::warn!(message = %message, "Provider error");
                    self.ctx.monitor.set_error(message);
                }
                ProviderEvent::Ignored => {}
            }
        }

        metrics::record_processing_duration(started.elapsed());
        Flow::Continue
    }

    fn on_quote(&mut self, session: &mut LiveSession, payload: &serde_json::Value) {
        let result = self.normalizer.normalize(
            payload,
            self.ctx.adapter.schema(),
            self.ctx.multiplexer.as_ref(),
            self.machine.session(),
            Utc::now(),
        );

        match result {
            Ok(tick) => {
                if self.machine.state() == ConnectionState::Subscribing {
                    self.go_live(session, TransitionReason::FirstTick);
                }
                self.ctx.monitor.record_tick();
                metrics::record_tick_accepted(tick.pair());
                let evicted = self.ctx.fanout.publish(&tick);
                if evicted > 0 {
                    metrics::record_buffer_overflow(evicted as u64);
                }
            }
            Err(rejection) => {
                tracing::debug!(
                    reason = %rejection.reason,
                    pair = ?rejection.pair,
                    detail = %rejection.detail,
                    "Rejected provider payload"
                );
                self.ctx.monitor.set_rejections(self.normalizer.rejections());
                metrics::record_tick_rejected(rejection.reason);
            }
        }
    }

    /// Enter Live and start the heartbeat for this Live period.
    fn go_live(&mut self, session: &mut LiveSession, reason: TransitionReason) {
        if !self.transition(ConnectionState::Live, reason) {
            return;
        }
        session.subscription_deadline = None;
        session.liveness.reset();
        self.policy.mark_live(Instant::now());

        session.stop_heartbeat();
        let cancel = self.cancel.child_token();
        let manager = HeartbeatManager::new(
            self.config.heartbeat.clone(),
            Arc::clone(&session.liveness),
            self.machine.timer_tag(),
            session.heartbeat_tx.clone(),
            cancel.clone(),
        );
        session.heartbeat_cancel = Some(cancel);
        tokio::spawn(manager.run());
    }

    fn transport_failed(&self, error: &TransportError) -> Flow {
        self.ctx.monitor.set_error(error.to_string());
        if *error == TransportError::Closed {
            Flow::End(TransitionReason::TransportClosed)
        } else {
            Flow::End(TransitionReason::TransportError)
        }
    }

    /// Apply a transition and publish it. Returns false if it was invalid.
    fn transition(&mut self, to: ConnectionState, reason: TransitionReason) -> bool {
        match self.machine.transition(to, reason) {
            Ok(transition) => {
                tracing::info!(
                    from = %transition.from,
                    to = %transition.to,
                    reason = %transition.reason,
                    generation = self.machine.generation(),
                    "Connection state changed"
                );
                self.ctx.monitor.record_transition(&transition);
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring invalid connection transition");
                false
            }
        }
    }
}
