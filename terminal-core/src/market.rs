//! Market data structures: price quotes and tradable instruments

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Which feed produced a price quote
///
/// Price is stream-authoritative; a poll-sourced quote only fills in while
/// the stream is silent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuoteSource {
    Stream,
    Poll,
}

/// Last traded price for a symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceQuote {
    pub symbol: String,
    pub price: Decimal,
    pub timestamp: DateTime<Utc>,
    pub source: QuoteSource,
}

impl PriceQuote {
    pub fn new(
        symbol: impl Into<String>,
        price: Decimal,
        timestamp: DateTime<Utc>,
        source: QuoteSource,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            price,
            timestamp,
            source,
        }
    }

    /// Quote received on the streaming feed, stamped now
    pub fn from_stream(symbol: impl Into<String>, price: Decimal) -> Self {
        Self::new(symbol, price, Utc::now(), QuoteSource::Stream)
    }

    /// Quote fetched by the polling fallback, stamped now
    pub fn from_poll(symbol: impl Into<String>, price: Decimal) -> Self {
        Self::new(symbol, price, Utc::now(), QuoteSource::Poll)
    }

    /// Age of the quote relative to `now`
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.timestamp)
    }
}

/// A tradable instrument from the exchange's instrument list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolInfo {
    /// Instrument identifier (e.g., "BTCUSDT")
    pub symbol: String,

    /// Exchange trading status (e.g., "Trading")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,

    /// Minimum price increment
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tick_size: Option<Decimal>,

    /// Minimum quantity increment
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qty_step: Option<Decimal>,

    /// Minimum order quantity
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_order_qty: Option<Decimal>,
}

impl SymbolInfo {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            status: None,
            tick_size: None,
            qty_step: None,
            min_order_qty: None,
        }
    }

    /// Whether the exchange reports the instrument as tradable
    pub fn is_trading(&self) -> bool {
        self.status
            .as_deref()
            .map(|s| s.eq_ignore_ascii_case("trading"))
            .unwrap_or(true)
    }
}

/// Canonical symbol form: trimmed and upper-cased
pub fn normalize_symbol(symbol: &str) -> String {
    symbol.trim().to_uppercase()
}
