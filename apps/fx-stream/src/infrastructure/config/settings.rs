//! Stream Configuration Settings
//!
//! Configuration types for the FX stream, loaded from environment variables.
//! Everything is validated before the first connection attempt.

use std::collections::BTreeSet;
use std::time::Duration;

use crate::application::services::{
    HeartbeatConfig, ReconnectConfig, SessionConfig, ShutdownMode, SupervisorConfig,
};
use crate::domain::buffer::DEFAULT_BUFFER_CAPACITY;
use crate::domain::normalizer::DEFAULT_MAX_PRICE_AGE;
use crate::domain::subscription::DEFAULT_MAX_PAIRS;
use crate::domain::tick::{CurrencyPair, PairParseError};
use crate::infrastructure::provider::ProviderKind;

/// Pairs subscribed when `FX_PAIRS` is unset.
pub const DEFAULT_PAIRS: &str = "EUR/USD";

/// Provider API credentials.
#[derive(Clone)]
pub struct Credentials {
    api_key: String,
}

impl Credentials {
    /// Create new credentials.
    #[must_use]
    pub const fn new(api_key: String) -> Self {
        Self { api_key }
    }

    /// Get the API key.
    #[must_use]
    pub fn api_key(&self) -> &str {
        &self.api_key
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

/// Working set and buffering settings.
#[derive(Debug, Clone)]
pub struct StreamSettings {
    /// Pairs subscribed at startup, canonical order.
    pub pairs: Vec<CurrencyPair>,
    /// Working set limit.
    pub max_pairs: usize,
    /// Capacity of each consumer buffer.
    pub buffer_capacity: usize,
    /// Maximum accepted price age (zero disables the check).
    pub max_price_age: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            pairs: parse_pairs(DEFAULT_PAIRS).unwrap_or_default(),
            max_pairs: DEFAULT_MAX_PAIRS,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            max_price_age: DEFAULT_MAX_PRICE_AGE,
        }
    }
}

/// WebSocket connection settings.
#[derive(Debug, Clone)]
pub struct WebSocketSettings {
    /// Wait for a subscription acknowledgment or first tick.
    pub subscription_timeout: Duration,
    /// Heartbeat ping interval.
    pub heartbeat_interval: Duration,
    /// Silence after which the connection is considered dead.
    pub staleness_timeout: Duration,
    /// Initial reconnection delay.
    pub reconnect_delay_initial: Duration,
    /// Maximum reconnection delay.
    pub reconnect_delay_max: Duration,
    /// Reconnection delay multiplier for exponential backoff.
    pub reconnect_delay_multiplier: f64,
    /// Upward jitter as a fraction of the delay.
    pub reconnect_jitter: f64,
    /// Maximum reconnection attempts before giving up (0 = unlimited).
    pub max_reconnect_attempts: u32,
    /// Live period after which the backoff resets.
    pub stable_live: Duration,
    /// Wait for a transport close before the session is dropped.
    pub close_timeout: Duration,
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        let reconnect = ReconnectConfig::default();
        let heartbeat = HeartbeatConfig::default();
        Self {
            subscription_timeout: Duration::from_secs(10),
            heartbeat_interval: heartbeat.ping_interval,
            staleness_timeout: heartbeat.staleness_timeout,
            reconnect_delay_initial: reconnect.initial_delay,
            reconnect_delay_max: reconnect.max_delay,
            reconnect_delay_multiplier: reconnect.multiplier,
            reconnect_jitter: reconnect.jitter_factor,
            max_reconnect_attempts: reconnect.max_attempts,
            stable_live: reconnect.stable_live,
            close_timeout: SessionConfig::default().close_timeout,
        }
    }
}

/// Shutdown behavior.
#[derive(Debug, Clone)]
pub struct ShutdownSettings {
    /// Upper bound on a graceful stop.
    pub timeout: Duration,
    /// What happens to buffered ticks.
    pub mode: ShutdownMode,
}

impl Default for ShutdownSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            mode: ShutdownMode::Drain,
        }
    }
}

/// Server port settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Health check and metrics HTTP port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { health_port: 8082 }
    }
}

/// Complete stream configuration.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Market data provider.
    pub provider: ProviderKind,
    /// API credentials.
    pub credentials: Credentials,
    /// Working set and buffering.
    pub stream: StreamSettings,
    /// Connection timing.
    pub websocket: WebSocketSettings,
    /// Shutdown behavior.
    pub shutdown: ShutdownSettings,
    /// Server ports.
    pub server: ServerSettings,
}

impl StreamConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a required variable is missing or empty, a value
    /// does not parse, or the combination is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Same as [`StreamConfig::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let api_key = env
            .get("FX_API_KEY")
            .ok_or_else(|| ConfigError::MissingEnvVar("FX_API_KEY".to_string()))?;
        if api_key.trim().is_empty() {
            return Err(ConfigError::EmptyValue("FX_API_KEY".to_string()));
        }

        let provider = match env.get("FX_PROVIDER") {
            Some(value) => value.parse().map_err(|reason| ConfigError::InvalidValue {
                key: "FX_PROVIDER".to_string(),
                reason,
            })?,
            None => ProviderKind::default(),
        };

        let stream_defaults = StreamSettings::default();
        let pairs = match env.get("FX_PAIRS") {
            Some(value) => parse_pairs(&value)?,
            None => stream_defaults.pairs,
        };
        let stream = StreamSettings {
            pairs,
            max_pairs: env.parse("FX_MAX_PAIRS", stream_defaults.max_pairs)?,
            buffer_capacity: env.parse("FX_BUFFER_CAPACITY", stream_defaults.buffer_capacity)?,
            max_price_age: env.secs("FX_MAX_PRICE_AGE_SECS", stream_defaults.max_price_age)?,
        };

        let ws = WebSocketSettings::default();
        let websocket = WebSocketSettings {
            subscription_timeout: env.secs("FX_SUBSCRIPTION_TIMEOUT_SECS", ws.subscription_timeout)?,
            heartbeat_interval: env.secs("FX_HEARTBEAT_INTERVAL_SECS", ws.heartbeat_interval)?,
            staleness_timeout: env.secs("FX_STALENESS_TIMEOUT_SECS", ws.staleness_timeout)?,
            reconnect_delay_initial: env
                .millis("FX_RECONNECT_DELAY_INITIAL_MS", ws.reconnect_delay_initial)?,
            reconnect_delay_max: env.secs("FX_RECONNECT_DELAY_MAX_SECS", ws.reconnect_delay_max)?,
            reconnect_delay_multiplier: env
                .parse("FX_RECONNECT_DELAY_MULTIPLIER", ws.reconnect_delay_multiplier)?,
            reconnect_jitter: env.parse("FX_RECONNECT_JITTER", ws.reconnect_jitter)?,
            max_reconnect_attempts: env
                .parse("FX_MAX_RECONNECT_ATTEMPTS", ws.max_reconnect_attempts)?,
            stable_live: env.secs("FX_STABLE_LIVE_SECS", ws.stable_live)?,
            close_timeout: env.secs("FX_CLOSE_TIMEOUT_SECS", ws.close_timeout)?,
        };

        let shutdown_defaults = ShutdownSettings::default();
        let shutdown = ShutdownSettings {
            timeout: env.secs("FX_SHUTDOWN_TIMEOUT_SECS", shutdown_defaults.timeout)?,
            mode: match env.get("FX_SHUTDOWN_MODE") {
                Some(value) => value.parse().map_err(|reason| ConfigError::InvalidValue {
                    key: "FX_SHUTDOWN_MODE".to_string(),
                    reason,
                })?,
                None => shutdown_defaults.mode,
            },
        };

        let server = ServerSettings {
            health_port: env.parse("FX_HEALTH_PORT", ServerSettings::default().health_port)?,
        };

        let config = Self {
            provider,
            credentials: Credentials::new(api_key),
            stream,
            websocket,
            shutdown,
            server,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] or [`ConfigError::TooManyPairs`]
    /// describing the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stream.max_pairs == 0 {
            return Err(ConfigError::Invalid("FX_MAX_PAIRS must be at least 1".to_string()));
        }
        if self.stream.pairs.len() > self.stream.max_pairs {
            return Err(ConfigError::TooManyPairs {
                count: self.stream.pairs.len(),
                max: self.stream.max_pairs,
            });
        }
        if self.stream.buffer_capacity == 0 {
            return Err(ConfigError::Invalid(
                "FX_BUFFER_CAPACITY must be at least 1".to_string(),
            ));
        }

        let ws = &self.websocket;
        if ws.subscription_timeout.is_zero()
            || ws.staleness_timeout.is_zero()
            || ws.close_timeout.is_zero()
        {
            return Err(ConfigError::Invalid(
                "subscription, staleness and close timeouts must be positive".to_string(),
            ));
        }
        if ws.heartbeat_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "FX_HEARTBEAT_INTERVAL_SECS must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&ws.reconnect_jitter) {
            return Err(ConfigError::Invalid(
                "FX_RECONNECT_JITTER must be between 0 and 1".to_string(),
            ));
        }
        if ws.reconnect_delay_multiplier < 1.0 + ws.reconnect_jitter {
            return Err(ConfigError::Invalid(format!(
                "FX_RECONNECT_DELAY_MULTIPLIER ({}) must be at least 1 + FX_RECONNECT_JITTER ({})",
                ws.reconnect_delay_multiplier, ws.reconnect_jitter
            )));
        }
        if ws.reconnect_delay_initial.is_zero() || ws.reconnect_delay_max < ws.reconnect_delay_initial {
            return Err(ConfigError::Invalid(
                "reconnect delays must satisfy 0 < initial <= max".to_string(),
            ));
        }
        Ok(())
    }

    /// Supervisor configuration derived from these settings.
    #[must_use]
    pub fn supervisor_config(&self) -> SupervisorConfig {
        let ws = &self.websocket;
        SupervisorConfig {
            pairs: self.stream.pairs.clone(),
            max_pairs: self.stream.max_pairs,
            buffer_capacity: self.stream.buffer_capacity,
            max_price_age: self.stream.max_price_age,
            session: SessionConfig {
                subscription_timeout: ws.subscription_timeout,
                heartbeat: HeartbeatConfig::new(ws.heartbeat_interval, ws.staleness_timeout),
                reconnect: ReconnectConfig {
                    initial_delay: ws.reconnect_delay_initial,
                    max_delay: ws.reconnect_delay_max,
                    multiplier: ws.reconnect_delay_multiplier,
                    jitter_factor: ws.reconnect_jitter,
                    max_attempts: ws.max_reconnect_attempts,
                    stable_live: ws.stable_live,
                },
                close_timeout: ws.close_timeout,
            },
            shutdown_timeout: self.shutdown.timeout,
            shutdown_mode: self.shutdown.mode,
        }
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable does not parse.
    #[error("invalid value for {key}: {reason}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// Parse failure.
        reason: String,
    },
    /// A pair in `FX_PAIRS` does not parse.
    #[error("invalid pair {0:?} in FX_PAIRS: {1}")]
    InvalidPair(String, #[source] PairParseError),
    /// More pairs than the working set allows.
    #[error("{count} pairs configured but FX_MAX_PAIRS is {max}")]
    TooManyPairs {
        /// Configured pairs.
        count: usize,
        /// Limit.
        max: usize,
    },
    /// Constraint between settings violated.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Parse a comma-separated pair list, dropping duplicates.
fn parse_pairs(value: &str) -> Result<Vec<CurrencyPair>, ConfigError> {
    let mut pairs = BTreeSet::new();
    for item in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let pair = item
            .parse()
            .map_err(|e| ConfigError::InvalidPair(item.to_string(), e))?;
        pairs.insert(pair);
    }
    Ok(pairs.into_iter().collect())
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            None => Ok(default),
            Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                reason: format!("{value:?}: {e}"),
            }),
        }
    }

    fn secs(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        match self.get(key) {
            None => Ok(default),
            Some(_) => self.parse::<u64>(key, 0).map(Duration::from_secs),
        }
    }

    fn millis(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        match self.get(key) {
            None => Ok(default),
            Some(_) => self.parse::<u64>(key, 0).map(Duration::from_millis),
        }
    }
}
