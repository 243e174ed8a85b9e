//! Connection Monitor
//!
//! Shared, lock-light view of the connection task used by the health
//! readout. The connection task writes; the supervisor and the health
//! server read.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;

use crate::domain::connection::{ConnectionState, StateTransition, TransitionReason};
use crate::domain::normalizer::{RejectReason, RejectionCounts};
use crate::domain::tick::{CurrencyPair, SequenceGap};
use crate::infrastructure::metrics;

/// Number of transitions kept for the health readout.
pub const TRANSITION_HISTORY: usize = 64;

/// Connection task state shared with readers.
#[derive(Debug)]
pub struct ConnectionMonitor {
    state: watch::Sender<ConnectionState>,
    transitions: RwLock<VecDeque<StateTransition>>,
    last_live_at: RwLock<Option<DateTime<Utc>>>,
    last_error: RwLock<Option<String>>,
    rejections: RwLock<RejectionCounts>,
    session: AtomicU64,
    reconnect_attempts: AtomicU32,
    reconnects: AtomicU64,
    messages_received: AtomicU64,
    ticks_accepted: AtomicU64,
    sequence_resets: AtomicU64,
}

impl Default for ConnectionMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionMonitor {
    /// Create a monitor in `Disconnected`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: watch::Sender::new(ConnectionState::Disconnected),
            transitions: RwLock::new(VecDeque::with_capacity(TRANSITION_HISTORY)),
            last_live_at: RwLock::new(None),
            last_error: RwLock::new(None),
            rejections: RwLock::new(RejectionCounts::default()),
            session: AtomicU64::new(0),
            reconnect_attempts: AtomicU32::new(0),
            reconnects: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            ticks_accepted: AtomicU64::new(0),
            sequence_resets: AtomicU64::new(0),
        }
    }

    /// Record a state transition.
    pub fn record_transition(&self, transition: &StateTransition) {
        if transition.to == ConnectionState::Live {
            *self.last_live_at.write() = Some(transition.at);
        }
        if transition.reason == TransitionReason::BackoffElapsed {
            self.reconnects.fetch_add(1, Ordering::Relaxed);
            metrics::record_reconnect();
        }

        {
            let mut log = self.transitions.write();
            if log.len() == TRANSITION_HISTORY {
                log.pop_front();
            }
            log.push_back(transition.clone());
        }

        metrics::set_connection_state(transition.to);
        self.state.send_replace(transition.to);
    }

    /// Force `Disconnected` after the connection task was aborted.
    pub fn force_disconnected(&self) {
        let from = *self.state.borrow();
        if from != ConnectionState::Disconnected {
            self.record_transition(&StateTransition {
                from,
                to: ConnectionState::Disconnected,
                reason: TransitionReason::Shutdown,
                at: Utc::now(),
            });
        }
    }

    /// Record the latest error.
    pub fn set_error(&self, message: impl Into<String>) {
        *self.last_error.write() = Some(message.into());
    }

    /// Record the current session generation.
    pub fn set_session(&self, session: u64) {
        self.session.store(session, Ordering::Relaxed);
    }

    /// Record the current backoff attempt count.
    pub fn set_reconnect_attempts(&self, attempts: u32) {
        self.reconnect_attempts.store(attempts, Ordering::Relaxed);
    }

    /// Count an inbound frame.
    pub fn record_message(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Count an accepted tick.
    pub fn record_tick(&self) {
        self.ticks_accepted.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a restart that lost the normalizer and its per-pair sequences.
    pub fn record_sequence_reset(&self) {
        self.sequence_resets.fetch_add(1, Ordering::Relaxed);
    }

    /// Mirror the normalizer's rejection counters.
    pub fn set_rejections(&self, counts: RejectionCounts) {
        *self.rejections.write() = counts;
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch state changes.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Recorded transitions, oldest first.
    #[must_use]
    pub fn transitions(&self) -> Vec<StateTransition> {
        self.transitions.read().iter().cloned().collect()
    }

    /// Rejection counters.
    #[must_use]
    pub fn rejections(&self) -> RejectionCounts {
        *self.rejections.read()
    }

    /// Count of rejections for one reason.
    #[must_use]
    pub fn rejection_count(&self, reason: RejectReason) -> u64 {
        self.rejections.read().get(reason)
    }

    /// Snapshot of the connection counters.
    #[must_use]
    pub fn connection_health(&self) -> ConnectionHealth {
        ConnectionHealth {
            state: self.state(),
            session: self.session.load(Ordering::Relaxed),
            last_live_at: *self.last_live_at.read(),
            last_error: self.last_error.read().clone(),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            ticks_accepted: self.ticks_accepted.load(Ordering::Relaxed),
            sequence_resets: self.sequence_resets.load(Ordering::Relaxed),
            rejections: self.rejections(),
            transitions: self.transitions(),
        }
    }
}

// =============================================================================
// Health Readout
// =============================================================================

/// Connection part of the health readout.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionHealth {
    /// Current state.
    pub state: ConnectionState,
    /// Generation of the current or last transport session.
    pub session: u64,
    /// Last time the session went Live.
    pub last_live_at: Option<DateTime<Utc>>,
    /// Latest error message.
    pub last_error: Option<String>,
    /// Backoff attempts since the last reset.
    pub reconnect_attempts: u32,
    /// Reconnections since start.
    pub reconnects: u64,
    /// Frames received since start.
    pub messages_received: u64,
    /// Ticks accepted since start.
    pub ticks_accepted: u64,
    /// Restarts where per-pair sequences began again at 1.
    pub sequence_resets: u64,
    /// Normalizer rejections.
    pub rejections: RejectionCounts,
    /// Recent transitions, oldest first.
    pub transitions: Vec<StateTransition>,
}

/// Buffer statistics for one consumer.
#[derive(Debug, Clone, Serialize)]
pub struct ConsumerHealth {
    /// Buffered ticks.
    pub buffered: usize,
    /// Buffer capacity.
    pub capacity: usize,
    /// Ticks evicted.
    pub overflow: u64,
    /// Sequence gaps seen on delivery.
    pub gaps: u64,
    /// Most recent gap.
    pub last_gap: Option<SequenceGap>,
}

/// Full health readout of a supervisor.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    /// True between `start()` and `stop()`.
    pub running: bool,
    /// Provider name.
    pub provider: &'static str,
    /// Active pairs.
    pub pairs: Vec<CurrencyPair>,
    /// Connection counters and history.
    pub connection: ConnectionHealth,
    /// Per-consumer buffer statistics.
    pub consumers: Vec<ConsumerHealth>,
    /// Ticks evicted across consumers.
    pub overflow_total: u64,
    /// Most recent gap across consumers.
    pub last_gap: Option<SequenceGap>,
}

impl HealthSnapshot {
    /// True if any recorded transition matches.
    #[must_use]
    pub fn saw_transition(
        &self,
        from: ConnectionState,
        to: ConnectionState,
        reason: TransitionReason,
    ) -> bool {
        self.connection
            .transitions
            .iter()
            .any(|t| t.from == from && t.to == to && t.reason == reason)
    }
}

// =============================================================================
// Tests
// =============================================================================
