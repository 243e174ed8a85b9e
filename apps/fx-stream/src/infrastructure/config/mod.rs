//! Configuration Module
//!
//! Environment-driven configuration for the stream service.

mod settings;

pub use settings::{
    ConfigError, Credentials, DEFAULT_PAIRS, ServerSettings, ShutdownSettings, StreamConfig,
    StreamSettings, WebSocketSettings,
};
