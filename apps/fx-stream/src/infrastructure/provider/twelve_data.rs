//! Twelve Data Adapter
//!
//! # Stream URL
//!
//! `wss://ws.twelvedata.com/v1/quotes/price?apikey=<key>`
//!
//! # Protocol
//!
//! The API key travels in the URL, so there is no auth message. Symbols use
//! the `EUR/USD` form. Messages are single JSON objects tagged by `event`:
//!
//! ```json
//! {"event":"subscribe-status","status":"ok","success":[{"symbol":"EUR/USD"}],"fails":[]}
//! {"event":"price","symbol":"EUR/USD","timestamp":1700000000,"price":1.0712,"bid":1.0711,"ask":1.0713}
//! {"event":"heartbeat","status":"ok"}
//! ```
//!
//! `bid`/`ask` are not sent for every symbol; `price` is then used for both
//! sides.

use std::collections::BTreeSet;

use serde_json::{Value, json};

use super::codec::{JsonCodec, str_field};
use crate::application::ports::{CodecError, ProviderAdapter, ProviderEvent};
use crate::domain::normalizer::{ProviderSchema, TimestampUnit};
use crate::domain::subscription::{ChannelId, ChannelNaming};
use crate::domain::tick::CurrencyPair;

/// Twelve Data WebSocket endpoint.
pub const TWELVE_DATA_URL: &str = "wss://ws.twelvedata.com/v1/quotes/price";

/// Twelve Data price stream.
pub struct TwelveDataAdapter {
    api_key: String,
    codec: JsonCodec,
    schema: ProviderSchema,
}

impl TwelveDataAdapter {
    /// Create an adapter for `api_key`.
    #[must_use]
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            codec: JsonCodec::new(),
            schema: ProviderSchema::new("symbol", "bid", "ask", "timestamp", TimestampUnit::Seconds)
                .with_price_field("price"),
        }
    }

    fn classify(value: Value) -> ProviderEvent {
        match str_field(&value, "event") {
            Some("price") => ProviderEvent::Quote(value),
            Some("subscribe-status") => ProviderEvent::SubscribeAck {
                succeeded: symbols(&value, "success"),
                failed: symbols(&value, "fails"),
            },
            Some("heartbeat") => ProviderEvent::Heartbeat,
            _ if str_field(&value, "status") == Some("error") => {
                ProviderEvent::Error(error_message(&value))
            }
            _ => ProviderEvent::Ignored,
        }
    }

    fn action(&self, action: &str, channels: &BTreeSet<ChannelId>) -> Option<String> {
        if channels.is_empty() {
            return None;
        }
        let symbols = channels.iter().map(String::as_str).collect::<Vec<_>>().join(",");
        self.codec
            .encode(&json!({ "action": action, "params": { "symbols": symbols } }))
            .ok()
    }
}

impl std::fmt::Debug for TwelveDataAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TwelveDataAdapter")
            .field("api_key", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

fn symbols(value: &Value, key: &str) -> Vec<String> {
    value
        .get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| str_field(item, "symbol").or_else(|| item.as_str()))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn error_message(value: &Value) -> String {
    match value.get("messages").or_else(|| value.get("message")) {
        Some(Value::Array(items)) => items
            .iter()
            .map(|m| m.as_str().map_or_else(|| m.to_string(), str::to_string))
            .collect::<Vec<_>>()
            .join("; "),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => value.to_string(),
    }
}

impl ChannelNaming for TwelveDataAdapter {
    fn channel_id(&self, pair: &CurrencyPair) -> ChannelId {
        pair.to_string()
    }
}

impl ProviderAdapter for TwelveDataAdapter {
    fn name(&self) -> &'static str {
        "twelvedata"
    }

    fn endpoint_url(&self) -> String {
        format!("{TWELVE_DATA_URL}?apikey={}", self.api_key)
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
