//! Tick Normalizer
//!
//! Converts provider payloads into canonical [`Tick`] records.
//!
//! Each provider adapter describes its wire layout with a [`ProviderSchema`]
//! (which keys hold the pair, prices and timestamp, and the timestamp unit).
//! The normalizer validates the payload against that schema and either
//! produces a tick or returns a typed [`Rejection`]. It never panics on bad
//! input.
//!
//! # Sequencing
//!
//! The normalizer owns the per-pair sequence counters. A counter advances
//! only when a tick is accepted, so rejected messages never consume a
//! sequence number.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value;

use crate::domain::subscription::PairRegistry;
use crate::domain::tick::{CurrencyPair, Tick};

/// Default maximum age of a provider timestamp before a quote is stale.
pub const DEFAULT_MAX_PRICE_AGE: std::time::Duration = std::time::Duration::from_secs(300);

// =============================================================================
// Schema
// =============================================================================

/// Unit of the provider timestamp field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TimestampUnit {
    /// Unix seconds (integer, float or numeric string).
    Seconds,
    /// Unix milliseconds.
    Millis,
    /// RFC 3339 string.
    Rfc3339,
}

/// Field mapping describing where a provider puts each tick attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSchema {
    /// Key holding the pair symbol.
    pub pair_field: String,
    /// Key holding the bid price.
    pub bid_field: String,
    /// Key holding the ask price.
    pub ask_field: String,
    /// Key holding a single last price, used for both sides when the
    /// payload carries neither bid nor ask.
    pub price_field: Option<String>,
    /// Key holding the provider timestamp.
    pub timestamp_field: String,
    /// Unit of the timestamp field.
    pub timestamp_unit: TimestampUnit,
}

impl ProviderSchema {
    /// Create a schema with the given keys and no single-price fallback.
    #[must_use]
    pub fn new(
        pair_field: impl Into<String>,
        bid_field: impl Into<String>,
        ask_field: impl Into<String>,
        timestamp_field: impl Into<String>,
        timestamp_unit: TimestampUnit,
    ) -> Self {
        Self {
            pair_field: pair_field.into(),
            bid_field: bid_field.into(),
            ask_field: ask_field.into(),
            price_field: None,
            timestamp_field: timestamp_field.into(),
            timestamp_unit,
        }
    }

    /// Use `field` as a single price when bid and ask are both absent.
    #[must_use]
    pub fn with_price_field(mut self, field: impl Into<String>) -> Self {
        self.price_field = Some(field.into());
        self
    }
}

// =============================================================================
// Rejections
// =============================================================================

/// Reason code for a rejected payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RejectReason {
    /// Missing or invalid fields, crossed quote, or unparseable pair.
    MalformedPayload,
    /// The pair is not in the active subscription.
    UnknownPair,
    /// The quote is too old, or replays the last accepted quote.
    StalePrice,
}

impl RejectReason {
    /// Short label used in logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::MalformedPayload => "malformed_payload",
            Self::UnknownPair => "unknown_pair",
            Self::StalePrice => "stale_price",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A payload the normalizer refused to turn into a tick.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason}: {detail}")]
pub struct Rejection {
    /// Reason code.
    pub reason: RejectReason,
    /// Pair, when it could be determined.
    pub pair: Option<CurrencyPair>,
    /// Human-readable detail.
    pub detail: String,
}

impl Rejection {
    fn malformed(pair: Option<CurrencyPair>, detail: impl Into<String>) -> Self {
        Self {
            reason: RejectReason::MalformedPayload,
            pair,
            detail: detail.into(),
        }
    }
}

/// Rejection counters by reason.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RejectionCounts {
    /// Malformed payloads.
    pub malformed_payload: u64,
    /// Pairs outside the subscription.
    pub unknown_pair: u64,
    /// Stale or replayed quotes.
    pub stale_price: u64,
}

impl RejectionCounts {
    /// Total rejections.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.malformed_payload + self.unknown_pair + self.stale_price
    }

    /// Count for one reason.
    #[must_use]
    pub const fn get(&self, reason: RejectReason) -> u64 {
        match reason {
            RejectReason::MalformedPayload => self.malformed_payload,
            RejectReason::UnknownPair => self.unknown_pair,
            RejectReason::StalePrice => self.stale_price,
        }
    }

    const fn increment(&mut self, reason: RejectReason) {
        match reason {
            RejectReason::MalformedPayload => self.malformed_payload += 1,
            RejectReason::UnknownPair => self.unknown_pair += 1,
            RejectReason::StalePrice => self.stale_price += 1,
        }
    }
}

// =============================================================================
// Normalizer
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct LastAccepted {
    sequence: u64,
    timestamp: DateTime<Utc>,
    bid: Option<Decimal>,
    ask: Option<Decimal>,
}

/// Stateful normalizer owning per-pair sequence counters.
///
/// Not shared between tasks; the receive loop owns it and calls
/// [`TickNormalizer::normalize`] through `&mut self`.
#[derive(Debug)]
pub struct TickNormalizer {
    max_price_age: Option<Duration>,
    last: HashMap<CurrencyPair, LastAccepted>,
    rejections: RejectionCounts,
}

impl Default for TickNormalizer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PRICE_AGE)
    }
}

impl TickNormalizer {
    /// Create a normalizer. A zero `max_price_age` disables the age check.
    #[must_use]
    pub fn new(max_price_age: std::time::Duration) -> Self {
        let max_price_age = if max_price_age.is_zero() {
            None
        } else {
            Duration::from_std(max_price_age).ok()
        };
        Self {
            max_price_age,
            last: HashMap::new(),
            rejections: RejectionCounts::default(),
        }
    }

    /// Normalize one provider payload.
    ///
    /// `active` decides which pairs are currently subscribed, `session` is
    /// the connection generation stamped on the tick and `received_at` is
    /// the local ingestion time.
    ///
    /// # Errors
    ///
    /// Returns a [`Rejection`] for malformed payloads, pairs outside the
    /// subscription and stale or replayed quotes. Rejections leave the
    /// sequence counters untouched.
    pub fn normalize(
        &mut self,
        payload: &Value,
        schema: &ProviderSchema,
        active: &dyn PairRegistry,
        session: u64,
        received_at: DateTime<Utc>,
    ) -> Result<Tick, Rejection> {
        let result = self.try_normalize(payload, schema, active, session, received_at);
        if let Err(rejection) = &result {
            self.rejections.increment(rejection.reason);
        }
        result
    }

    fn try_normalize(
        &mut self,
        payload: &Value,
        schema: &ProviderSchema,
        active: &dyn PairRegistry,
        session: u64,
        received_at: DateTime<Utc>,
    ) -> Result<Tick, Rejection> {
        let Some(object) = payload.as_object() else {
            return Err(Rejection::malformed(None, "payload is not a JSON object"));
        };

        let symbol = object
            .get(&schema.pair_field)
            .and_then(Value::as_str)
            .ok_or_else(|| Rejection::malformed(None, format!("missing `{}`", schema.pair_field)))?;
        let pair = CurrencyPair::from_str(symbol)
            .map_err(|e| Rejection::malformed(None, e.to_string()))?;

        let mut bid = optional_price(object.get(&schema.bid_field), &schema.bid_field, pair)?;
        let mut ask = optional_price(object.get(&schema.ask_field), &schema.ask_field, pair)?;
        if bid.is_none()
            && ask.is_none()
            && let Some(field) = &schema.price_field
        {
            let price = optional_price(object.get(field), field, pair)?;
            bid = price;
            ask = price;
        }
        if bid.is_none() && ask.is_none() {
            return Err(Rejection::malformed(Some(pair), "no price fields present"));
        }
        if let (Some(b), Some(a)) = (bid, ask)
            && b > a
        {
            return Err(Rejection::malformed(
                Some(pair),
                format!("crossed quote: bid {b} > ask {a}"),
            ));
        }

        let timestamp = object
            .get(&schema.timestamp_field)
            .and_then(|raw| parse_timestamp(raw, schema.timestamp_unit))
            .ok_or_else(|| {
                Rejection::malformed(
                    Some(pair),
                    format!("missing or invalid `{}`", schema.timestamp_field),
                )
            })?;

        if !active.contains_pair(&pair) {
            return Err(Rejection {
                reason: RejectReason::UnknownPair,
                pair: Some(pair),
                detail: format!("{pair} is not subscribed"),
            });
        }

        if let Some(max_age) = self.max_price_age
            && received_at - timestamp > max_age
        {
            return Err(Rejection {
                reason: RejectReason::StalePrice,
                pair: Some(pair),
                detail: format!("timestamp {timestamp} older than {}s", max_age.num_seconds()),
            });
        }

        let previous = self.last.get(&pair).copied();
        if let Some(prev) = previous
            && prev.timestamp == timestamp
            && prev.bid == bid
            && prev.ask == ask
        {
            return Err(Rejection {
                reason: RejectReason::StalePrice,
                pair: Some(pair),
                detail: format!("replay of sequence {}", prev.sequence),
            });
        }

        let timestamp_anomaly = previous.is_some_and(|prev| timestamp < prev.timestamp);
        let sequence = previous.map_or(1, |prev| prev.sequence + 1);

        self.last.insert(
            pair,
            LastAccepted {
                sequence,
                timestamp,
                bid,
                ask,
            },
        );

        Ok(Tick::new(
            pair,
            bid,
            ask,
            timestamp,
            received_at,
            sequence,
            timestamp_anomaly,
            session,
        ))
    }

    /// Last sequence number assigned to `pair`, if any tick was accepted.
    #[must_use]
    pub fn last_sequence(&self, pair: &CurrencyPair) -> Option<u64> {
        self.last.get(pair).map(|last| last.sequence)
    }

    /// Rejection counters since creation.
    #[must_use]
    pub const fn rejections(&self) -> RejectionCounts {
        self.rejections
    }
}

// =============================================================================
// Field Parsing
// =============================================================================

fn optional_price(
    raw: Option<&Value>,
    field: &str,
    pair: CurrencyPair,
) -> Result<Option<Decimal>, Rejection> {
    match raw {
        None | Some(Value::Null) => Ok(None),
        Some(value) => match parse_decimal(value) {
            Some(price) if price > Decimal::ZERO => Ok(Some(price)),
            Some(price) => Err(Rejection::malformed(
                Some(pair),
                format!("non-positive `{field}`: {price}"),
            )),
            None => Err(Rejection::malformed(
                Some(pair),
                format!("non-numeric `{field}`: {value}"),
            )),
        },
    }
}

fn parse_decimal(value: &Value) -> Option<Decimal> {
    let text = match value {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.trim().to_string(),
        _ => return None,
    };
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .ok()
}

fn parse_timestamp(value: &Value, unit: TimestampUnit) -> Option<DateTime<Utc>> {
    match unit {
        TimestampUnit::Rfc3339 => value
            .as_str()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc)),
        TimestampUnit::Seconds => {
            let secs = parse_decimal(value)?;
            let whole = secs.trunc();
            let nanos = ((secs - whole) * Decimal::from(1_000_000_000)).trunc();
            DateTime::from_timestamp(
                i64::try_from(whole).ok()?,
                u32::try_from(nanos).ok()?,
            )
        }
        TimestampUnit::Millis => {
            let millis = parse_decimal(value)?.trunc();
            DateTime::from_timestamp_millis(i64::try_from(millis).ok()?)
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use proptest::prelude::*;
    use serde_json::json;
    use test_case::test_case;

    use super::*;

    fn schema() -> ProviderSchema {
        ProviderSchema::new("symbol", "bid", "ask", "timestamp", TimestampUnit::Seconds)
            .with_price_field("price")
    }

    fn active(pairs: &[&str]) -> BTreeSet<CurrencyPair> {
        pairs.iter().map(|p| p.parse().unwrap()).collect()
    }

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_100, 0).unwrap()
    }

    fn quote(symbol: &str, bid: f64, ask: f64, ts: i64) -> Value {
        json!({"symbol": symbol, "bid": bid, "ask": ask, "timestamp": ts})
    }

    #[test]
    fn accepts_valid_quote() {
        let mut normalizer = TickNormalizer::default();
        let tick = normalizer
            .normalize(
                &quote("EUR/USD", 1.0841, 1.0843, 1_700_000_000),
                &schema(),
                &active(&["EUR/USD"]),
                3,
                now(),
            )
            .unwrap();

        assert_eq!(tick.pair().to_string(), "EUR/USD");
        assert_eq!(tick.bid(), Some(Decimal::from_str("1.0841").unwrap()));
        assert_eq!(tick.ask(), Some(Decimal::from_str("1.0843").unwrap()));
        assert_eq!(tick.sequence(), 1);
        assert_eq!(tick.session(), 3);
        assert_eq!(tick.received_at(), now());
        assert!(!tick.timestamp_anomaly());
    }

    #[test]
    fn accepts_numeric_strings_and_single_price() {
        let mut normalizer = TickNormalizer::default();
        let payload = json!({"symbol": "USDJPY", "price": "151.25", "timestamp": "1700000000"});
        let tick = normalizer
            .normalize(&payload, &schema(), &active(&["USD/JPY"]), 1, now())
            .unwrap();
        assert_eq!(tick.bid(), Some(Decimal::from_str("151.25").unwrap()));
        assert_eq!(tick.ask(), tick.bid());
    }

    #[test]
    fn accepts_one_sided_quote() {
        let mut normalizer = TickNormalizer::default();
        let payload = json!({"symbol": "EUR/USD", "ask": 1.1, "timestamp": 1_700_000_000});
        let tick = normalizer
            .normalize(&payload, &schema(), &active(&["EUR/USD"]), 1, now())
            .unwrap();
        assert!(tick.bid().is_none());
        assert!(tick.ask().is_some());
    }

    #[test]
    fn sequence_increments_per_pair() {
        let mut normalizer = TickNormalizer::default();
        let set = active(&["EUR/USD", "USD/JPY"]);
        for ts in 0..3 {
            let tick = normalizer
                .normalize(
                    &quote("EUR/USD", 1.0, 1.1, 1_700_000_000 + ts),
                    &schema(),
                    &set,
                    1,
                    now(),
                )
                .unwrap();
            assert_eq!(tick.sequence(), u64::try_from(ts).unwrap() + 1);
        }
        let jpy = normalizer
            .normalize(&quote("USD/JPY", 150.0, 150.1, 1_700_000_000), &schema(), &set, 1, now())
            .unwrap();
        assert_eq!(jpy.sequence(), 1);
        assert_eq!(normalizer.last_sequence(&"EUR/USD".parse().unwrap()), Some(3));
    }

    #[test_case(json!({"bid": 1.0, "ask": 1.1, "timestamp": 1_700_000_000}) ; "missing pair")]
    #[test_case(json!({"symbol": "EUR/USD", "timestamp": 1_700_000_000}) ; "missing prices")]
    #[test_case(json!({"symbol": "EUR/USD", "bid": "abc", "ask": 1.1, "timestamp": 1_700_000_000}) ; "non numeric bid")]
    #[test_case(json!({"symbol": "EUR/USD", "bid": 1.2, "ask": 1.1, "timestamp": 1_700_000_000}) ; "crossed quote")]
    #[test_case(json!({"symbol": "EUR/USD", "bid": 1.0, "ask": 1.1}) ; "missing timestamp")]
    #[test_case(json!({"symbol": "EUR/USD", "bid": 1.0, "ask": 1.1, "timestamp": "soon"}) ; "bad timestamp")]
    #[test_case(json!({"symbol": "EURO/USD", "bid": 1.0, "ask": 1.1, "timestamp": 1_700_000_000}) ; "bad pair")]
    #[test_case(json!({"symbol": "EUR/USD", "bid": -1.0, "ask": 1.1, "timestamp": 1_700_000_000}) ; "negative price")]
    #[test_case(json!([1, 2, 3]) ; "not an object")]
    fn rejects_malformed(payload: Value) {
        let mut normalizer = TickNormalizer::default();
        let rejection = normalizer
            .normalize(&payload, &schema(), &active(&["EUR/USD"]), 1, now())
            .unwrap_err();
        assert_eq!(rejection.reason, RejectReason::MalformedPayload);
        assert_eq!(normalizer.last_sequence(&"EUR/USD".parse().unwrap()), None);
        assert_eq!(normalizer.rejections().malformed_payload, 1);
    }

    #[test]
    fn rejects_unknown_pair() {
        let mut normalizer = TickNormalizer::default();
        let rejection = normalizer
            .normalize(
                &quote("EUR/GBP", 0.85, 0.86, 1_700_000_000),
                &schema(),
                &active(&["EUR/USD"]),
                1,
                now(),
            )
            .unwrap_err();
        assert_eq!(rejection.reason, RejectReason::UnknownPair);
        assert_eq!(rejection.pair, Some("EUR/GBP".parse().unwrap()));
        assert_eq!(normalizer.rejections().get(RejectReason::UnknownPair), 1);
    }

    #[test]
    fn rejects_old_timestamp() {
        let mut normalizer = TickNormalizer::new(std::time::Duration::from_secs(60));
        let rejection = normalizer
            .normalize(
                &quote("EUR/USD", 1.0, 1.1, 1_700_000_000 - 3600),
                &schema(),
                &active(&["EUR/USD"]),
                1,
                now(),
            )
            .unwrap_err();
        assert_eq!(rejection.reason, RejectReason::StalePrice);
    }

    #[test]
    fn zero_max_age_disables_age_check() {
        let mut normalizer = TickNormalizer::new(std::time::Duration::ZERO);
        let tick = normalizer.normalize(
            &quote("EUR/USD", 1.0, 1.1, 1_000_000_000),
            &schema(),
            &active(&["EUR/USD"]),
            1,
            now(),
        );
        assert!(tick.is_ok());
    }

    #[test]
    fn rejects_exact_replay_of_last_quote() {
        let mut normalizer = TickNormalizer::default();
        let set = active(&["EUR/USD"]);
        let payload = quote("EUR/USD", 1.0, 1.1, 1_700_000_000);
        normalizer.normalize(&payload, &schema(), &set, 1, now()).unwrap();

        let rejection = normalizer
            .normalize(&payload, &schema(), &set, 2, now())
            .unwrap_err();
        assert_eq!(rejection.reason, RejectReason::StalePrice);
        assert_eq!(normalizer.last_sequence(&"EUR/USD".parse().unwrap()), Some(1));
    }

    #[test]
    fn flags_backward_timestamp() {
        let mut normalizer = TickNormalizer::default();
        let set = active(&["EUR/USD"]);
        normalizer
            .normalize(&quote("EUR/USD", 1.0, 1.1, 1_700_000_050), &schema(), &set, 1, now())
            .unwrap();
        let tick = normalizer
            .normalize(&quote("EUR/USD", 1.0, 1.2, 1_700_000_040), &schema(), &set, 1, now())
            .unwrap();
        assert!(tick.timestamp_anomaly());
        assert_eq!(tick.sequence(), 2);
    }

    #[test_case(json!(1_700_000_000_123_i64), TimestampUnit::Millis, 123 ; "millis")]
    #[test_case(json!(1_700_000_000.5), TimestampUnit::Seconds, 500 ; "fractional seconds")]
    #[test_case(json!("2023-11-14T22:13:20.250Z"), TimestampUnit::Rfc3339, 250 ; "rfc3339")]
    fn parses_timestamp_units(raw: Value, unit: TimestampUnit, millis: u32) {
        let ts = parse_timestamp(&raw, unit).unwrap();
        assert_eq!(ts.timestamp(), 1_700_000_000);
        assert_eq!(ts.timestamp_subsec_millis(), millis);
    }

    proptest! {
        #[test]
        fn accepted_ticks_are_ordered_and_uncrossed(
            quotes in prop::collection::vec((1u32..200_000, 0u32..500, -5i64..60), 1..40)
        ) {
            let mut normalizer = TickNormalizer::new(std::time::Duration::ZERO);
            let set = active(&["EUR/USD"]);
            let mut last_seq = 0;
            for (bid_pips, spread, dt) in quotes {
                let bid = Decimal::new(i64::from(bid_pips), 4);
                let ask = bid + Decimal::new(i64::from(spread), 4);
                let payload = json!({
                    "symbol": "EUR/USD",
                    "bid": bid.to_string(),
                    "ask": ask.to_string(),
                    "timestamp": 1_700_000_000 + dt,
                });
                if let Ok(tick) = normalizer.normalize(&payload, &schema(), &set, 1, now()) {
                    prop_assert!(tick.bid() <= tick.ask());
                    prop_assert!(tick.sequence() > last_seq);
                    last_seq = tick.sequence();
                }
            }
        }

        #[test]
        fn malformed_input_never_moves_counters(garbage in "[a-z]{0,8}") {
            let mut normalizer = TickNormalizer::default();
            let set = active(&["EUR/USD"]);
            let payload = json!({"symbol": "EUR/USD", "bid": garbage, "ask": 1.1, "timestamp": 1_700_000_000});
            let result = normalizer.normalize(&payload, &schema(), &set, 1, now());
            prop_assert!(result.is_err());
            prop_assert_eq!(normalizer.last_sequence(&"EUR/USD".parse().unwrap()), None);
        }
    }
}
