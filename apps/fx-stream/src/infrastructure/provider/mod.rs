//! Provider Adapters
//!
//! Concrete [`ProviderAdapter`] implementations:
//!
//! - [`TwelveDataAdapter`]: Twelve Data price stream (default)
//! - [`PolygonAdapter`]: Polygon.io forex quotes
//! - [`GenericAdapter`]: schema-driven JSON protocol

pub mod codec;
pub mod generic;
pub mod polygon;
pub mod twelve_data;

use std::sync::Arc;

pub use codec::JsonCodec;
pub use generic::GenericAdapter;
pub use polygon::PolygonAdapter;
pub use twelve_data::TwelveDataAdapter;

use crate::application::ports::ProviderAdapter;

/// Provider selectable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProviderKind {
    /// Twelve Data.
    #[default]
    TwelveData,
    /// Polygon.io.
    Polygon,
}

impl ProviderKind {
    /// Configuration name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::TwelveData => "twelvedata",
            Self::Polygon => "polygon",
        }
    }

    /// Build the adapter for this provider.
    #[must_use]
    pub fn adapter(self, api_key: &str) -> Arc<dyn ProviderAdapter> {
        match self {
            Self::TwelveData => Arc::new(TwelveDataAdapter::new(api_key)),
            Self::Polygon => Arc::new(PolygonAdapter::new(api_key)),
        }
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace(['-', '_', '.', ' '], "").as_str() {
            "twelvedata" => Ok(Self::TwelveData),
            "polygon" | "polygonio" => Ok(Self::Polygon),
            _ => Err(format!("unknown provider: {s}")),
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
