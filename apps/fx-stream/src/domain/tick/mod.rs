//! Tick Types
//!
//! Canonical representation of an FX price observation. Ticks are produced
//! by the normalizer and never mutated afterwards.
//!
//! # Pair Notation
//!
//! Providers disagree on how a currency pair is written (`EUR/USD`,
//! `EURUSD`, `EUR_USD`). [`CurrencyPair`] accepts all of them and always
//! displays as `BASE/QUOTE`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// =============================================================================
// Currency
// =============================================================================

/// A three-letter currency code (ISO 4217 style), stored uppercase.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Currency([u8; 3]);

impl Currency {
    /// Parse a currency code. Accepts any ASCII case.
    ///
    /// # Errors
    ///
    /// Returns an error unless the input is exactly three ASCII letters.
    pub fn new(code: &str) -> Result<Self, PairParseError> {
        let bytes = code.as_bytes();
        if bytes.len() != 3 || !bytes.iter().all(u8::is_ascii_alphabetic) {
            return Err(PairParseError::InvalidCurrency(code.to_string()));
        }
        Ok(Self([
            bytes[0].to_ascii_uppercase(),
            bytes[1].to_ascii_uppercase(),
            bytes[2].to_ascii_uppercase(),
        ]))
    }

    /// The code as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        // Constructed only from ASCII letters.
        std::str::from_utf8(&self.0).unwrap_or("???")
    }
}

impl fmt::Debug for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Currency Pair
// =============================================================================

/// A currency pair such as `EUR/USD`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CurrencyPair {
    base: Currency,
    quote: Currency,
}

impl CurrencyPair {
    /// Create a pair from two currencies.
    ///
    /// # Errors
    ///
    /// Returns [`PairParseError::SameCurrency`] if base and quote are equal.
    pub fn new(base: Currency, quote: Currency) -> Result<Self, PairParseError> {
        if base == quote {
            return Err(PairParseError::SameCurrency(base.to_string()));
        }
        Ok(Self { base, quote })
    }

    /// The base currency.
    #[must_use]
    pub const fn base(&self) -> Currency {
        self.base
    }

    /// The quote currency.
    #[must_use]
    pub const fn quote(&self) -> Currency {
        self.quote
    }
}

impl FromStr for CurrencyPair {
    type Err = PairParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let (base, quote) = if let Some(idx) = trimmed.find(['/', '-', '_']) {
            (&trimmed[..idx], &trimmed[idx + 1..])
        } else if trimmed.len() == 6 && trimmed.is_ascii() {
            trimmed.split_at(3)
        } else {
            return Err(PairParseError::InvalidFormat(s.to_string()));
        };

        Self::new(Currency::new(base)?, Currency::new(quote)?)
    }
}

impl fmt::Debug for CurrencyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)
    }
}

impl fmt::Display for CurrencyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)
    }
}

impl Serialize for CurrencyPair {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CurrencyPair {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Errors produced when parsing currencies and pairs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PairParseError {
    /// Not a three-letter code.
    #[error("invalid currency code: {0:?}")]
    InvalidCurrency(String),
    /// Unrecognized pair notation.
    #[error("invalid currency pair: {0:?}")]
    InvalidFormat(String),
    /// Base and quote are the same currency.
    #[error("pair has identical base and quote: {0}")]
    SameCurrency(String),
}

// =============================================================================
// Tick
// =============================================================================

/// One bid/ask observation for a currency pair.
///
/// Fields are private so a tick cannot be altered once the normalizer has
/// built it. At least one of `bid`/`ask` is present, and `bid <= ask` when
/// both are.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tick {
    pair: CurrencyPair,
    bid: Option<Decimal>,
    ask: Option<Decimal>,
    timestamp: DateTime<Utc>,
    received_at: DateTime<Utc>,
    sequence: u64,
    timestamp_anomaly: bool,
    session: u64,
}

impl Tick {
    #[allow(clippy::too_many_arguments)]
    pub(crate) const fn new(
        pair: CurrencyPair,
        bid: Option<Decimal>,
        ask: Option<Decimal>,
        timestamp: DateTime<Utc>,
        received_at: DateTime<Utc>,
        sequence: u64,
        timestamp_anomaly: bool,
        session: u64,
    ) -> Self {
        Self {
            pair,
            bid,
            ask,
            timestamp,
            received_at,
            sequence,
            timestamp_anomaly,
            session,
        }
    }

    /// The currency pair.
    #[must_use]
    pub const fn pair(&self) -> CurrencyPair {
        self.pair
    }

    /// Bid price, if the provider sent one.
    #[must_use]
    pub const fn bid(&self) -> Option<Decimal> {
        self.bid
    }

    /// Ask price, if the provider sent one.
    #[must_use]
    pub const fn ask(&self) -> Option<Decimal> {
        self.ask
    }

    /// Provider-reported time of the observation.
    #[must_use]
    pub const fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Local time the message was ingested.
    #[must_use]
    pub const fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    /// Per-pair sequence number, starting at 1.
    #[must_use]
    pub const fn sequence(&self) -> u64 {
        self.sequence
    }

    /// True when the provider timestamp went backwards for this pair.
    #[must_use]
    pub const fn timestamp_anomaly(&self) -> bool {
        self.timestamp_anomaly
    }

    /// Generation of the transport session the tick arrived on.
    #[must_use]
    pub const fn session(&self) -> u64 {
        self.session
    }

    /// Midpoint of bid and ask, if both are present.
    #[must_use]
    pub fn mid(&self) -> Option<Decimal> {
        match (self.bid, self.ask) {
            (Some(bid), Some(ask)) => Some((bid + ask) / Decimal::TWO),
            _ => None,
        }
    }

    /// Ask minus bid, if both are present.
    #[must_use]
    pub fn spread(&self) -> Option<Decimal> {
        match (self.bid, self.ask) {
            (Some(bid), Some(ask)) => Some(ask - bid),
            _ => None,
        }
    }
}

// =============================================================================
// Sequence Gap
// =============================================================================

/// A discontinuity in delivered sequence numbers for a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SequenceGap {
    /// Pair the gap was observed on.
    pub pair: CurrencyPair,
    /// The sequence number that should have come next.
    pub expected: u64,
    /// The sequence number actually delivered.
    pub received: u64,
}

impl SequenceGap {
    /// Number of ticks missing.
    #[must_use]
    pub const fn missing(&self) -> u64 {
        self.received.saturating_sub(self.expected)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use test_case::test_case;

    use super::*;

    #[test_case("EUR/USD" ; "slash")]
    #[test_case("EURUSD" ; "compact")]
    #[test_case("eur-usd" ; "dash lowercase")]
    #[test_case("EUR_USD" ; "underscore")]
    #[test_case(" EUR/USD " ; "padded")]
    fn pair_parses_common_notations(input: &str) {
        let pair = CurrencyPair::from_str(input).unwrap();
        assert_eq!(pair.to_string(), "EUR/USD");
        assert_eq!(pair.base().as_str(), "EUR");
        assert_eq!(pair.quote().as_str(), "USD");
    }

    #[test_case("EURUS" ; "too short")]
    #[test_case("EU/USD" ; "short base")]
    #[test_case("EUR/US1" ; "digit")]
    #[test_case("" ; "empty")]
    #[test_case("USD/USD" ; "same currency")]
    fn pair_rejects_invalid(input: &str) {
        assert!(CurrencyPair::from_str(input).is_err());
    }

    #[test]
    fn pair_components() {
        let pair: CurrencyPair = "usd/jpy".parse().unwrap();
        assert_eq!(pair.base().to_string(), "USD");
        assert_eq!(pair.quote().to_string(), "JPY");
    }

    #[test]
    fn pair_serde_uses_display() {
        let pair: CurrencyPair = "GBPUSD".parse().unwrap();
        let json = serde_json::to_string(&pair).unwrap();
        assert_eq!(json, "\"GBP/USD\"");
        let back: CurrencyPair = serde_json::from_str(&json).unwrap();
        assert_eq!(back, pair);
    }

    #[test]
    fn tick_mid_and_spread() {
        let pair: CurrencyPair = "EUR/USD".parse().unwrap();
        let now = Utc::now();
        let tick = Tick::new(
            pair,
            Some(Decimal::new(11000, 4)),
            Some(Decimal::new(11002, 4)),
            now,
            now,
            1,
            false,
            1,
        );
        assert_eq!(tick.mid(), Some(Decimal::new(11001, 4)));
        assert_eq!(tick.spread(), Some(Decimal::new(2, 4)));

        // Odd sums keep full precision.
        let tick = Tick::new(
            pair,
            Some(Decimal::new(11001, 4)),
            Some(Decimal::new(11002, 4)),
            now,
            now,
            2,
            false,
            1,
        );
        assert_eq!(tick.mid(), Some(Decimal::new(110015, 5)));
    }

    #[test]
    fn tick_mid_requires_both_sides() {
        let pair: CurrencyPair = "EUR/USD".parse().unwrap();
        let now = Utc::now();
        let bid_only = Tick::new(pair, Some(Decimal::ONE), None, now, now, 1, false, 1);
        assert!(bid_only.mid().is_none());
        assert!(bid_only.spread().is_none());

        let ask_only = Tick::new(pair, None, Some(Decimal::ONE), now, now, 2, false, 1);
        assert!(ask_only.mid().is_none());
        assert!(ask_only.spread().is_none());
    }

    #[test]
    fn gap_missing_count() {
        let gap = SequenceGap {
            pair: "EUR/USD".parse().unwrap(),
            expected: 4,
            received: 9,
        };
        assert_eq!(gap.missing(), 5);
    }
}
