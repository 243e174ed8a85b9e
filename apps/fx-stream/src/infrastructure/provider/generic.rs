//! Generic JSON Adapter
//!
//! Schema-driven adapter for providers that speak a simple typed JSON
//! protocol, and for feeds replayed in tests.
//!
//! # Protocol
//!
//! Client requests:
//!
//! ```json
//! {"type":"subscribe","channels":["EUR/USD"]}
//! {"type":"unsubscribe","channels":["EUR/USD"]}
//! ```
//!
//! Server messages are objects (or arrays of objects) classified by `type`:
//! `connected`, `subscribed` (with `channels`), `heartbeat`, `error` and
//! `auth_failed` (with `message`). Any other object carrying the schema's
//! pair field is a quote.

use std::collections::BTreeSet;

use serde_json::{Value, json};

use super::codec::{JsonCodec, str_field};
use crate::application::ports::{CodecError, ProviderAdapter, ProviderEvent};
use crate::domain::normalizer::ProviderSchema;
use crate::domain::subscription::{ChannelId, ChannelNaming};
use crate::domain::tick::CurrencyPair;

/// Adapter configured entirely by URL, channel prefix and schema.
#[derive(Debug, Clone)]
pub struct GenericAdapter {
    name: &'static str,
    url: String,
    channel_prefix: String,
    schema: ProviderSchema,
    codec: JsonCodec,
}

impl GenericAdapter {
    /// Create an adapter named `name` connecting to `url`.
    #[must_use]
    pub fn new(name: &'static str, url: impl Into<String>, schema: ProviderSchema) -> Self {
        Self {
            name,
            url: url.into(),
            channel_prefix: String::new(),
            schema,
            codec: JsonCodec::new(),
        }
    }

    /// Prefix channel identifiers with `prefix`.
    #[must_use]
    pub fn with_channel_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.channel_prefix = prefix.into();
        self
    }

    fn classify(&self, value: Value) -> ProviderEvent {
        match str_field(&value, "type") {
            Some("connected") => ProviderEvent::Connected,
            Some("subscribed") => ProviderEvent::SubscribeAck {
                succeeded: value
                    .get("channels")
                    .and_then(Value::as_array)
                    .map(|c| c.iter().filter_map(Value::as_str).map(str::to_string).collect())
                    .unwrap_or_default(),
                failed: Vec::new(),
            },
            Some("heartbeat") => ProviderEvent::Heartbeat,
            Some("error") => ProviderEvent::Error(
                str_field(&value, "message").unwrap_or("unspecified error").to_string(),
            ),
            Some("auth_failed") => ProviderEvent::AuthFailed(
                str_field(&value, "message").unwrap_or("credentials rejected").to_string(),
            ),
            Some("quote") => ProviderEvent::Quote(value),
            Some(_) => ProviderEvent::Ignored,
            None if value.get(&self.schema.pair_field).is_some() => ProviderEvent::Quote(value),
            None => ProviderEvent::Ignored,
        }
    }

    fn request(&self, kind: &str, channels: &BTreeSet<ChannelId>) -> Option<String> {
        if channels.is_empty() {
            return None;
        }
        self.codec
            .encode(&json!({ "type": kind, "channels": channels }))
            .ok()
    }
}

impl ChannelNaming for GenericAdapter {
    fn channel_id(&self, pair: &CurrencyPair) -> ChannelId {
        format!("{}{pair}", self.channel_prefix)
    }
}

impl ProviderAdapter for GenericAdapter {
    fn name(&self) -> &'static str {
        self.name
    }

    fn endpoint_url(&self) -> String {
        self.url.clone()
    }

    fn parse(&self, text: &str) -> Result<Vec<ProviderEvent>, CodecError> {
        Ok(self
            .codec
            .decode(text)?
            .into_iter()
            .map(|value| self.classify(value))
            .collect())
    }

    fn schema(&self) -> &ProviderSchema {
        &self.schema
    }

    fn subscribe_message(&self, channels: &BTreeSet<ChannelId>) -> Option<String> {
        self.request("subscribe", channels)
    }

    fn unsubscribe_message(&self, channels: &BTreeSet<ChannelId>) -> Option<String> {
        self.request("unsubscribe", channels)
    }
}
