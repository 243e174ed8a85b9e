//! Polygon.io Forex Adapter
//!
//! # Stream URL
//!
//! `wss://socket.polygon.io/forex`
//!
//! # Protocol
//!
//! Frames are JSON arrays tagged by `ev`. The server greets the connection,
//! the client authenticates with `{"action":"auth","params":"<key>"}` and
//! subscribes only after `auth_success`:
//!
//! ```json
//! [{"ev":"status","status":"connected","message":"Connected Successfully"}]
//! [{"ev":"status","status":"auth_success","message":"authenticated"}]
//! [{"ev":"status","status":"success","message":"subscribed to: C.EUR/USD"}]
//! [{"ev":"C","p":"EUR/USD","x":48,"a":1.0713,"b":1.0711,"t":1700000000000}]
//! ```
//!
//! Quote channels are `C.<base>/<quote>`; timestamps are Unix milliseconds.

use std::collections::BTreeSet;

use serde_json::{Value, json};

use super::codec::{JsonCodec, str_field};
use crate::application::ports::{CodecError, ProviderAdapter, ProviderEvent};
use crate::domain::normalizer::{ProviderSchema, TimestampUnit};
use crate::domain::subscription::{ChannelId, ChannelNaming};
use crate::domain::tick::CurrencyPair;

/// Polygon.io forex WebSocket endpoint.
pub const POLYGON_FOREX_URL: &str = "wss://socket.polygon.io/forex";

/// Prefix of forex quote channels.
const QUOTE_CHANNEL_PREFIX: &str = "C.";

/// Polygon.io forex quote stream.
pub struct PolygonAdapter {
    api_key: String,
    codec: JsonCodec,
    schema: ProviderSchema,
}

impl PolygonAdapter {
    /// Create an adapter for `api_key`.
    #[must_use]
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            codec: JsonCodec::new(),
            schema: ProviderSchema::new("p", "b", "a", "t", TimestampUnit::Millis),
        }
    }

    fn classify(value: Value) -> ProviderEvent {
        match str_field(&value, "ev") {
            Some("C") => ProviderEvent::Quote(value),
            Some("status") => Self::classify_status(&value),
            _ => ProviderEvent::Ignored,
        }
    }

    fn classify_status(value: &Value) -> ProviderEvent {
        let message = str_field(value, "message").unwrap_or_default().to_string();
        match str_field(value, "status") {
            Some("connected") => ProviderEvent::Connected,
            Some("auth_success") => ProviderEvent::Authenticated,
            Some("auth_failed") => ProviderEvent::AuthFailed(message),
            Some("success") => match message.strip_prefix("subscribed to:") {
                Some(channels) => ProviderEvent::SubscribeAck {
                    succeeded: channels
                        .split(',')
                        .map(str::trim)
                        .filter(|c| !c.is_empty())
                        .map(str::to_string)
                        .collect(),
                    failed: Vec::new(),
                },
                None => ProviderEvent::Ignored,
            },
            Some("error") => ProviderEvent::Error(message),
            _ => ProviderEvent::Ignored,
        }
    }

    fn action(&self, action: &str, channels: &BTreeSet<ChannelId>) -> Option<String> {
        if channels.is_empty() {
            return None;
        }
        let params = channels.iter().map(String::as_str).collect::<Vec<_>>().join(",");
        self.codec
            .encode(&json!({ "action": action, "params": params }))
            .ok()
    }
}

impl std::fmt::Debug for PolygonAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolygonAdapter")
            .field("api_key", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

impl ChannelNaming for PolygonAdapter {
    fn channel_id(&self, pair: &CurrencyPair) -> ChannelId {
        format!("{QUOTE_CHANNEL_PREFIX}{pair}")
    }
}

impl ProviderAdapter for PolygonAdapter {
    fn name(&self) -> &'static str {
        "polygon"
    }

    fn endpoint_url(&self) -> String {
        POLYGON_FOREX_URL.to_string()
    }

    fn auth_message(&self) -> Option<String> {
        self.codec
            .encode(&json!({ "action": "auth", "params": self.api_key }))
            .ok()
    }

    fn subscribe_after_auth(&self) -> bool {
        true
    }

    fn parse(&self, text: &str) -> Result<Vec<ProviderEvent>, CodecError> {
        Ok(self
            .codec
            .decode(text)?
            .into_iter()
            .map(Self::classify)
            .collect())
    }

    fn schema(&self) -> &ProviderSchema {
        &self.schema
    }

    fn subscribe_message(&self, channels: &BTreeSet<ChannelId>) -> Option<String> {
        self.action("subscribe", channels)
    }

    fn unsubscribe_message(&self, channels: &BTreeSet<ChannelId>) -> Option<String> {
        self.action("unsubscribe", channels)
    }
}
