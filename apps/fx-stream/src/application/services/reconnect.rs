//! Reconnection Policy
//!
//! Exponential backoff with upward-only jitter for provider reconnection.
//!
//! Delays never decrease across consecutive failures: jitter only adds
//! time, the jittered delay is clamped to the cap, and the multiplier is
//! raised to at least `1 + jitter_factor`. The policy resets
//! to the initial delay only after the session stayed Live for the
//! configured stable period.

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

/// Configuration for reconnection behavior.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Initial delay before first reconnection attempt.
    pub initial_delay: Duration,
    /// Maximum delay between reconnection attempts.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (e.g., 2.0 doubles delay each attempt).
    pub multiplier: f64,
    /// Jitter factor as a fraction (e.g., 0.1 = up to +10%).
    pub jitter_factor: f64,
    /// Maximum number of reconnection attempts (0 = unlimited).
    pub max_attempts: u32,
    /// How long the session must stay Live before backoff resets.
    pub stable_live: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter_factor: 0.1,
            max_attempts: 0, // Unlimited
            stable_live: Duration::from_secs(300),
        }
    }
}

/// Reconnection policy implementing exponential backoff with jitter.
///
/// # Example
///
/// ```rust
/// use fx_stream::application::services::reconnect::{ReconnectConfig, ReconnectPolicy};
///
/// let mut policy = ReconnectPolicy::new(ReconnectConfig::default());
///
/// // Get delay for first attempt
/// let delay1 = policy.next_delay();
/// assert!(delay1.is_some());
///
/// // Session went live and stayed up long enough
/// policy.reset();
/// ```
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    current_delay: Duration,
    attempt_count: u32,
    live_since: Option<Instant>,
}

impl ReconnectPolicy {
    /// Create a new reconnection policy.
    ///
    /// The jitter factor is clamped to `[0, 1]` and the multiplier raised to
    /// at least `1 + jitter_factor`, so one attempt's jitter never exceeds
    /// the next attempt's growth.
    #[must_use]
    pub fn new(mut config: ReconnectConfig) -> Self {
        let jitter = if config.jitter_factor.is_finite() {
            config.jitter_factor.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let floor = 1.0 + jitter;
        if config.multiplier.is_nan() || config.multiplier < floor {
            tracing::warn!(
                multiplier = config.multiplier,
                jitter_factor = jitter,
                "Backoff multiplier below 1 + jitter, raising it"
            );
            config.multiplier = floor;
        }
        config.jitter_factor = jitter;

        let initial_delay = config.initial_delay;
        Self {
            config,
            current_delay: initial_delay,
            attempt_count: 0,
            live_since: None,
        }
    }

    /// Get the next delay duration, applying exponential backoff with jitter.
    ///
    /// Returns `None` if max attempts have been exceeded.
    #[must_use]
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.should_retry() {
            return None;
        }

        self.attempt_count += 1;

        let delay_with_jitter = self.apply_jitter(self.current_delay);

        #[allow(clippy::cast_precision_loss)]
        let scaled = (self.current_delay.as_millis() as f64 * self.config.multiplier).round();
        let next_millis = if scaled.is_finite() && scaled > 0.0 {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            {
                scaled as u128
            }
        } else {
            0
        };
        let max_millis = self.config.max_delay.as_millis();
        let capped = next_millis.min(max_millis);
        let capped_u64 = u64::try_from(capped).unwrap_or(u64::MAX);
        self.current_delay = Duration::from_millis(capped_u64);

        Some(delay_with_jitter)
    }

    /// Record that the session reached Live.
    pub const fn mark_live(&mut self, at: Instant) {
        self.live_since = Some(at);
    }

    /// Record that the session left Live.
    ///
    /// Resets the backoff if the session had been Live for at least the
    /// stable period. Returns true if a reset happened.
    pub fn mark_disconnected(&mut self, at: Instant) -> bool {
        let Some(since) = self.live_since.take() else {
            return false;
        };
        if at.saturating_duration_since(since) >= self.config.stable_live {
            self.reset();
            true
        } else {
            false
        }
    }

    /// Reset the policy to the initial delay.
    pub const fn reset(&mut self) {
        self.current_delay = self.config.initial_delay;
        self.attempt_count = 0;
    }

    /// Get the current attempt count.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Check if reconnection should continue.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        self.config.max_attempts == 0 || self.attempt_count < self.config.max_attempts
    }

    /// Configured attempt limit (0 = unlimited).
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Add upward jitter, clamped to the configured cap.
    fn apply_jitter(&self, duration: Duration) -> Duration {
        let jittered = if self.config.jitter_factor <= 0.0 {
            duration
        } else {
            #[allow(clippy::cast_precision_loss)]
            let base_millis = duration.as_millis() as f64;
            let jitter_range = base_millis * self.config.jitter_factor;
            let mut rng = rand::rng();
            let jitter: f64 = rng.random_range(0.0..=jitter_range);
            let adjusted_millis = (base_millis + jitter).floor().max(1.0);

            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let adjusted_u64 = adjusted_millis as u64;
            Duration::from_millis(adjusted_u64)
        };
        jittered.min(self.config.max_delay.max(duration))
    }
}

/// Error type for reconnection failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReconnectError {
    /// Maximum reconnection attempts exceeded.
    #[error("maximum reconnection attempts ({0}) exceeded")]
    MaxAttemptsExceeded(u32),
}
