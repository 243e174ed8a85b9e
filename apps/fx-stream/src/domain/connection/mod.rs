//! Connection State Machine
//!
//! Lifecycle of the provider session:
//!
//! ```text
//! Disconnected → Connecting → Subscribing → Live
//!                    ↑             │          │
//!                    └── Backoff ◄─┴──────────┘
//! ```
//!
//! Every transition increments a generation counter. Timers capture the
//! generation through a [`TimerTag`] when they are armed, and a timer whose
//! tag is no longer current is ignored.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

// =============================================================================
// State
// =============================================================================

/// Connection state of the provider session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ConnectionState {
    /// Not connected and not trying to connect.
    Disconnected,
    /// Opening the transport.
    Connecting,
    /// Transport open, waiting for the subscription to be confirmed.
    Subscribing,
    /// Receiving data.
    Live,
    /// Waiting before the next connection attempt.
    Backoff,
}

impl ConnectionState {
    /// Short label used in logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Subscribing => "subscribing",
            Self::Live => "live",
            Self::Backoff => "backoff",
        }
    }

    /// Numeric code for the connection state gauge.
    #[must_use]
    pub const fn code(&self) -> u8 {
        match self {
            Self::Disconnected => 0,
            Self::Connecting => 1,
            Self::Subscribing => 2,
            Self::Live => 3,
            Self::Backoff => 4,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a transition happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TransitionReason {
    /// Supervisor started the session.
    Start,
    /// Transport connected.
    TransportConnected,
    /// Provider confirmed the subscription.
    SubscriptionAcknowledged,
    /// First valid tick arrived before an acknowledgment.
    FirstTick,
    /// Subscription set is empty.
    NothingToSubscribe,
    /// No acknowledgment within the subscription timeout.
    SubscriptionTimeout,
    /// No message within the staleness timeout.
    StalenessTimeout,
    /// Transport failed to connect, read or write.
    TransportError,
    /// Peer closed the transport.
    TransportClosed,
    /// Backoff delay elapsed.
    BackoffElapsed,
    /// Maximum reconnect attempts reached.
    RetriesExhausted,
    /// Provider rejected the credentials.
    AuthenticationFailed,
    /// Explicit shutdown.
    Shutdown,
}

impl fmt::Display for TransitionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A recorded state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateTransition {
    /// Previous state.
    pub from: ConnectionState,
    /// New state.
    pub to: ConnectionState,
    /// Cause.
    pub reason: TransitionReason,
    /// Wall-clock time of the change.
    pub at: DateTime<Utc>,
}

/// Attempted transition not allowed from the current state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid connection transition {from} -> {to} ({reason})")]
pub struct InvalidTransition {
    /// Current state.
    pub from: ConnectionState,
    /// Requested state.
    pub to: ConnectionState,
    /// Requested reason.
    pub reason: TransitionReason,
}

/// Generation captured by a timer when it was armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerTag(u64);

impl TimerTag {
    /// Raw generation value.
    #[must_use]
    pub const fn generation(self) -> u64 {
        self.0
    }
}

// =============================================================================
// State Machine
// =============================================================================

/// Validated connection state machine.
#[derive(Debug, Clone)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
    generation: u64,
    session: u64,
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateMachine {
    /// Create a machine in `Disconnected`.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            generation: 0,
            session: 0,
        }
    }

    /// Check if a state transition is valid.
    #[must_use]
    pub const fn is_valid_transition(from: ConnectionState, to: ConnectionState) -> bool {
        use ConnectionState::{Backoff, Connecting, Disconnected, Live, Subscribing};
        matches!(
            (from, to),
            (Disconnected | Backoff, Connecting)
                | (Connecting, Subscribing)
                | (Subscribing, Live)
                | (Connecting | Subscribing | Live, Backoff)
                | (Connecting | Subscribing | Live | Backoff, Disconnected)
        )
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// Generation, incremented on every transition.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Number of transport sessions opened so far. Stamped on ticks.
    #[must_use]
    pub const fn session(&self) -> u64 {
        self.session
    }

    /// Tag for a timer armed in the current state.
    #[must_use]
    pub const fn timer_tag(&self) -> TimerTag {
        TimerTag(self.generation)
    }

    /// True if a timer armed with `tag` still applies.
    #[must_use]
    pub const fn is_current(&self, tag: TimerTag) -> bool {
        tag.0 == self.generation
    }

    /// Move to `to`.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTransition`] if `to` is not reachable from the
    /// current state. The machine is unchanged in that case.
    pub fn transition(
        &mut self,
        to: ConnectionState,
        reason: TransitionReason,
    ) -> Result<StateTransition, InvalidTransition> {
        let from = self.state;
        if !Self::is_valid_transition(from, to) {
            return Err(InvalidTransition { from, to, reason });
        }

        self.state = to;
        self.generation += 1;
        if to == ConnectionState::Subscribing {
            self.session += 1;
        }

        Ok(StateTransition {
            from,
            to,
            reason,
            at: Utc::now(),
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
