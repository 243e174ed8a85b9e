//! Subscription Multiplexer
//!
//! Tracks the working set of currency pairs and the provider channel each
//! pair maps to.
//!
//! # Design
//!
//! The multiplexer owns:
//! - The canonical ordered set of active pairs
//! - The provider channel identifier for each pair
//! - The working-set limit
//!
//! Every mutation returns a [`SubscriptionChanges`] describing the channels
//! to subscribe or unsubscribe. The connection task applies those changes
//! as incremental messages on the live session; a change never forces a
//! reconnect.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::domain::tick::CurrencyPair;

/// Default maximum number of concurrently subscribed pairs.
pub const DEFAULT_MAX_PAIRS: usize = 12;

// =============================================================================
// Types
// =============================================================================

/// A provider-specific channel identifier (e.g. `C.EUR/USD`).
pub type ChannelId = String;

/// Maps a pair to the provider channel that carries its quotes.
pub trait ChannelNaming: Send + Sync {
    /// Channel identifier for `pair`.
    fn channel_id(&self, pair: &CurrencyPair) -> ChannelId;
}

/// Answers whether a pair is in the active subscription.
pub trait PairRegistry {
    /// True if `pair` is currently subscribed.
    fn contains_pair(&self, pair: &CurrencyPair) -> bool;
}

impl PairRegistry for BTreeSet<CurrencyPair> {
    fn contains_pair(&self, pair: &CurrencyPair) -> bool {
        self.contains(pair)
    }
}

/// Errors returned by the multiplexer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MultiplexerError {
    /// Adding the pair would exceed the working-set limit.
    #[error("cannot add {pair}: subscription limit of {max} pairs reached")]
    CapacityExceeded {
        /// Pair that was refused.
        pair: CurrencyPair,
        /// Configured limit.
        max: usize,
    },
}

// =============================================================================
// Subscription Changes
// =============================================================================

/// Channel-level changes to apply on the live session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionChanges {
    /// Channels to subscribe to.
    pub subscribe: BTreeSet<ChannelId>,
    /// Channels to unsubscribe from.
    pub unsubscribe: BTreeSet<ChannelId>,
}

impl SubscriptionChanges {
    /// Check if there are any changes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscribe.is_empty() && self.unsubscribe.is_empty()
    }

    /// Create changes with only subscribes.
    #[must_use]
    pub fn subscribe_only(channels: impl IntoIterator<Item = ChannelId>) -> Self {
        Self {
            subscribe: channels.into_iter().collect(),
            unsubscribe: BTreeSet::new(),
        }
    }

    /// Create changes with only unsubscribes.
    #[must_use]
    pub fn unsubscribe_only(channels: impl IntoIterator<Item = ChannelId>) -> Self {
        Self {
            subscribe: BTreeSet::new(),
            unsubscribe: channels.into_iter().collect(),
        }
    }

    /// Changes needed to move a session from `current` to `desired`.
    #[must_use]
    pub fn between(current: &BTreeSet<ChannelId>, desired: &BTreeSet<ChannelId>) -> Self {
        Self {
            subscribe: desired.difference(current).cloned().collect(),
            unsubscribe: current.difference(desired).cloned().collect(),
        }
    }
}

// =============================================================================
// Multiplexer
// =============================================================================

/// Thread-safe registry of subscribed pairs.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
///
/// use fx_stream::domain::subscription::{ChannelNaming, SubscriptionMultiplexer};
/// use fx_stream::domain::tick::CurrencyPair;
///
/// struct Plain;
///
/// impl ChannelNaming for Plain {
///     fn channel_id(&self, pair: &CurrencyPair) -> String {
///         pair.to_string()
///     }
/// }
///
/// let mux = SubscriptionMultiplexer::new(Arc::new(Plain), 12);
/// let eur: CurrencyPair = "EUR/USD".parse().unwrap();
///
/// let changes = mux.add_pair(eur).unwrap();
/// assert!(changes.subscribe.contains("EUR/USD"));
///
/// // Adding again is a no-op
/// assert!(mux.add_pair(eur).unwrap().is_empty());
///
/// let changes = mux.remove_pair(eur);
/// assert!(changes.unsubscribe.contains("EUR/USD"));
/// ```
pub struct SubscriptionMultiplexer {
    naming: Arc<dyn ChannelNaming>,
    max_pairs: usize,
    pairs: RwLock<BTreeMap<CurrencyPair, ChannelId>>,
}

impl std::fmt::Debug for SubscriptionMultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionMultiplexer")
            .field("max_pairs", &self.max_pairs)
            .field("pairs", &*self.pairs.read())
            .finish_non_exhaustive()
    }
}

impl SubscriptionMultiplexer {
    /// Create an empty multiplexer.
    #[must_use]
    pub fn new(naming: Arc<dyn ChannelNaming>, max_pairs: usize) -> Self {
        Self {
            naming,
            max_pairs,
            pairs: RwLock::new(BTreeMap::new()),
        }
    }

    /// Add a pair.
    ///
    /// Returns the channel to subscribe, or empty changes if the pair was
    /// already present.
    ///
    /// # Errors
    ///
    /// Returns [`MultiplexerError::CapacityExceeded`] if the working set is
    /// full. The set is left unchanged.
    pub fn add_pair(&self, pair: CurrencyPair) -> Result<SubscriptionChanges, MultiplexerError> {
        let mut pairs = self.pairs.write();
        if pairs.contains_key(&pair) {
            return Ok(SubscriptionChanges::default());
        }
        if pairs.len() >= self.max_pairs {
            return Err(MultiplexerError::CapacityExceeded {
                pair,
                max: self.max_pairs,
            });
        }

        let channel = self.naming.channel_id(&pair);
        pairs.insert(pair, channel.clone());
        Ok(SubscriptionChanges::subscribe_only([channel]))
    }

    /// Remove a pair.
    ///
    /// Returns the channel to unsubscribe, or empty changes if the pair was
    /// not present.
    pub fn remove_pair(&self, pair: CurrencyPair) -> SubscriptionChanges {
        self.pairs
            .write()
            .remove(&pair)
            .map(|channel| SubscriptionChanges::unsubscribe_only([channel]))
            .unwrap_or_default()
    }

    /// Active pairs in canonical order.
    #[must_use]
    pub fn pairs(&self) -> Vec<CurrencyPair> {
        self.pairs.read().keys().copied().collect()
    }

    /// Provider channels for the active pairs.
    #[must_use]
    pub fn channels(&self) -> BTreeSet<ChannelId> {
        self.pairs.read().values().cloned().collect()
    }

    /// Number of active pairs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pairs.read().len()
    }

    /// True if no pair is subscribed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pairs.read().is_empty()
    }

    /// Configured working-set limit.
    #[must_use]
    pub const fn max_pairs(&self) -> usize {
        self.max_pairs
    }
}

impl PairRegistry for SubscriptionMultiplexer {
    fn contains_pair(&self, pair: &CurrencyPair) -> bool {
        self.pairs.read().contains_key(pair)
    }
}

// =============================================================================
// Tests
// =============================================================================
