#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! FX Stream - Currency Pair Tick Ingestion
//!
//! Maintains a single WebSocket session to an FX market data provider,
//! normalizes its quotes into sequenced ticks and hands them to bounded
//! per-consumer buffers. The session reconnects with jittered exponential
//! backoff and resubscribes the active pair set after every reconnect.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Pure tick types and state machines
//!   - `tick`: Currency pairs, ticks and sequence gaps
//!   - `normalizer`: Provider payload validation and normalization
//!   - `subscription`: Active pair set and channel diffs
//!   - `connection`: Connection lifecycle state machine
//!   - `buffer`: Drop-oldest bounded buffers and fan-out
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Provider protocol, transport and sink interfaces
//!   - `services`: Reconnection, heartbeat, monitoring, supervision
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `provider`: Twelve Data, Polygon.io and generic JSON adapters
//!   - `websocket`: tokio-tungstenite transport
//!   - `config`: Environment configuration
//!   - `health`: Health check and metrics HTTP endpoint
//!
//! # Data Flow
//!
//! ```text
//! Provider WS ──► Session loop ──► Normalizer ──► Fan-out ──┬──► Buffer ──► Sink 1
//!                     │                                     ├──► Buffer ──► Sink 2
//!                     ▼                                     └──► Buffer ──► tick_buffer()
//!                  Monitor ──► /health
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core tick types with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::buffer::{TickBuffer, TickFanout};
pub use domain::connection::{ConnectionState, StateTransition, TransitionReason};
pub use domain::normalizer::{ProviderSchema, RejectReason, TickNormalizer, TimestampUnit};
pub use domain::subscription::{MultiplexerError, SubscriptionChanges, SubscriptionMultiplexer};
pub use domain::tick::{Currency, CurrencyPair, PairParseError, SequenceGap, Tick};

// Ports
pub use application::ports::{
    ProviderAdapter, ProviderEvent, TickSink, TransportConnector, TransportError, TransportFrame,
    TransportSession,
};

// Services
pub use application::services::{
    HealthSnapshot, ShutdownMode, StreamSupervisor, SupervisorConfig, SupervisorError,
};

// Infrastructure config
pub use infrastructure::config::{ConfigError, Credentials, StreamConfig};

// Providers and transport
pub use infrastructure::provider::{GenericAdapter, ProviderKind};
pub use infrastructure::websocket::WsConnector;

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
