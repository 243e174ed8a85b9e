//! Heartbeat Manager
//!
//! Asks the session loop to send WebSocket
//! pings on an interval and reports staleness when no inbound message of
//! any kind arrived within the staleness timeout.
//!
//! Every event carries the [`TimerTag`] the manager was started with, so an
//! event that arrives after the session left Live is recognized as stale
//! and ignored.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::domain::connection::TimerTag;

/// Lower bound for the staleness check period.
const MIN_CHECK_PERIOD: Duration = Duration::from_millis(10);

/// Configuration for heartbeat behavior.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Interval between ping messages.
    pub ping_interval: Duration,
    /// Silence after which the session is considered dead.
    pub staleness_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(15),
            staleness_timeout: Duration::from_secs(30),
        }
    }
}

impl HeartbeatConfig {
    /// Create a new configuration with custom values.
    #[must_use]
    pub const fn new(ping_interval: Duration, staleness_timeout: Duration) -> Self {
        Self {
            ping_interval,
            staleness_timeout,
        }
    }

    fn check_period(&self) -> Duration {
        (self.staleness_timeout / 4).max(MIN_CHECK_PERIOD)
    }
}

/// What the heartbeat manager is asking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatEventKind {
    /// Send a ping frame.
    SendPing,
    /// No inbound activity for at least the staleness timeout.
    Stale {
        /// How long the session has been silent.
        silent_for: Duration,
    },
}

/// Event emitted by the heartbeat manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatEvent {
    /// Generation the manager was started in.
    pub tag: TimerTag,
    /// Requested action.
    pub kind: HeartbeatEventKind,
}

/// Last inbound activity, shared between the session loop and the manager.
#[derive(Debug)]
pub struct LivenessState {
    last_activity: RwLock<Instant>,
}

impl Default for LivenessState {
    fn default() -> Self {
        Self::new()
    }
}

impl LivenessState {
    /// Create new liveness state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_activity: RwLock::new(Instant::now()),
        }
    }

    /// Record an inbound frame (data, ping or pong).
    pub fn record_activity(&self) {
        *self.last_activity.write() = Instant::now();
    }

    /// Time since the last inbound frame.
    #[must_use]
    pub fn time_since_activity(&self) -> Duration {
        self.last_activity.read().elapsed()
    }

    /// Reset state for a new session.
    pub fn reset(&self) {
        self.record_activity();
    }
}

/// Heartbeat manager for one Live period.
pub struct HeartbeatManager {
    config: HeartbeatConfig,
    state: Arc<LivenessState>,
    tag: TimerTag,
    event_tx: mpsc::Sender<HeartbeatEvent>,
    cancel: CancellationToken,
}

impl HeartbeatManager {
    /// Create a new heartbeat manager.
    #[must_use]
    pub const fn new(
        config: HeartbeatConfig,
        state: Arc<LivenessState>,
        tag: TimerTag,
        event_tx: mpsc::Sender<HeartbeatEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            state,
            tag,
            event_tx,
            cancel,
        }
    }

    /// Run the heartbeat loop.
    ///
    /// Runs until cancelled, until staleness is reported, or until the event
    /// channel closes.
    pub async fn run(self) {
        let now = Instant::now();
        let mut ping = tokio::time::interval_at(now + self.config.ping_interval, self.config.ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let period = self.config.check_period();
        let mut check = tokio::time::interval_at(now + period, period);
        check.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::trace!(generation = self.tag.generation(), "Heartbeat manager cancelled");
                    break;
                }
                _ = check.tick() => {
                    let silent_for = self.state.time_since_activity();
                    if silent_for >= self.config.staleness_timeout {
                        tracing::warn!(
                            silent_ms = silent_for.as_millis(),
                            timeout_ms = self.config.staleness_timeout.as_millis(),
                            "Staleness timeout detected"
                        );
                        let _ = self.emit(HeartbeatEventKind::Stale { silent_for }).await;
                        break;
                    }
                }
                _ = ping.tick() => {
                    if self.emit(HeartbeatEventKind::SendPing).await.is_err() {
                        tracing::debug!("Event channel closed, stopping heartbeat");
                        break;
                    }
                }
            }
        }
    }

    async fn emit(&self, kind: HeartbeatEventKind) -> Result<(), mpsc::error::SendError<HeartbeatEvent>> {
        self.event_tx
            .send(HeartbeatEvent {
                tag: self.tag,
                kind,
            })
            .await
    }
}
