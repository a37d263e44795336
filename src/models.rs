//! Shared data structures used throughout the application.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque venue identifier, e.g. `Binance`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExchangeId(String);

impl ExchangeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ExchangeId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Canonical `BASE/QUOTE` trading pair symbol.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Pair(String);

impl Pair {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self(symbol.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Splits into `(base, quote)`; `None` unless there is exactly one `/`.
    pub fn split(&self) -> Option<(&str, &str)> {
        split_symbol(&self.0)
    }

    pub fn base(&self) -> Option<&str> {
        self.split().map(|(base, _)| base)
    }

    pub fn quote(&self) -> Option<&str> {
        self.split().map(|(_, quote)| quote)
    }

    /// `QUOTE/BASE`, used as a resolution alias.
    pub fn reversed(&self) -> Option<Pair> {
        self.split()
            .map(|(base, quote)| Pair(format!("{quote}/{base}")))
    }
}

impl fmt::Display for Pair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Pair {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

pub(crate) fn split_symbol(symbol: &str) -> Option<(&str, &str)> {
    let (base, quote) = symbol.split_once('/')?;
    let (base, quote) = (base.trim(), quote.trim());
    if base.is_empty() || quote.is_empty() || quote.contains('/') {
        return None;
    }
    Some((base, quote))
}

/// Raw catalogue entry as returned by one exchange's `load_markets`.
///
/// Flags are optional because venues omit them; an absent flag never
/// disqualifies a market.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketDescriptor {
    pub symbol: String,
    #[serde(default)]
    pub base: Option<String>,
    #[serde(default)]
    pub quote: Option<String>,
    #[serde(default)]
    pub spot: Option<bool>,
    #[serde(default)]
    pub active: Option<bool>,
    #[serde(default)]
    pub contract: bool,
    #[serde(default)]
    pub future: bool,
    #[serde(default)]
    pub swap: bool,
    #[serde(default)]
    pub margin: bool,
}

impl MarketDescriptor {
    /// Active spot market with explicit base/quote.
    pub fn spot(symbol: &str) -> Self {
        let (base, quote) = split_symbol(symbol)
            .map(|(b, q)| (Some(b.to_string()), Some(q.to_string())))
            .unwrap_or((None, None));
        Self {
            symbol: symbol.to_string(),
            base,
            quote,
            spot: Some(true),
            active: Some(true),
            ..Self::default()
        }
    }
}

/// Top-of-book ticker returned by the gateway.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub last: Option<f64>,
    pub quote_volume: Option<f64>,
    pub base_volume: Option<f64>,
}

impl Ticker {
    pub fn new(bid: f64, ask: f64, last: f64) -> Self {
        Self {
            bid: Some(bid),
            ask: Some(ask),
            last: Some(last),
            ..Self::default()
        }
    }

    /// 24h volume: quote volume, falling back to base volume.
    pub fn volume(&self) -> Option<f64> {
        self.quote_volume.or(self.base_volume)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QuoteStatus {
    Ok,
    NoSymbol,
    Error,
    Timeout,
    WarmingUp,
}

impl fmt::Display for QuoteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            QuoteStatus::Ok => "OK",
            QuoteStatus::NoSymbol => "NO_SYMBOL",
            QuoteStatus::Error => "ERROR",
            QuoteStatus::Timeout => "TIMEOUT",
            QuoteStatus::WarmingUp => "WARMING_UP",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QuoteSource {
    Http,
    Ws,
}

/// One venue's quote for one pair at one moment.
///
/// A non-OK snapshot always carries zero prices and a reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteSnapshot {
    pub exchange: ExchangeId,
    pub pair: Pair,
    pub bid: f64,
    pub ask: f64,
    pub last: f64,
    pub spread_abs: f64,
    /// Local wall-clock time, `HH:MM:SS`.
    pub timestamp: String,
    pub status: QuoteStatus,
    pub source: QuoteSource,
    pub error: Option<String>,
}

impl QuoteSnapshot {
    pub fn ok(
        exchange: ExchangeId,
        pair: Pair,
        bid: f64,
        ask: f64,
        last: f64,
        source: QuoteSource,
        timestamp: String,
    ) -> Self {
        let spread_abs = if bid != 0.0 && ask != 0.0 { ask - bid } else { 0.0 };
        Self {
            exchange,
            pair,
            bid,
            ask,
            last,
            spread_abs,
            timestamp,
            status: QuoteStatus::Ok,
            source,
            error: None,
        }
    }

    pub fn failed(
        exchange: ExchangeId,
        pair: Pair,
        status: QuoteStatus,
        reason: impl Into<String>,
        source: QuoteSource,
        timestamp: String,
    ) -> Self {
        Self {
            exchange,
            pair,
            bid: 0.0,
            ask: 0.0,
            last: 0.0,
            spread_abs: 0.0,
            timestamp,
            status,
            source,
            error: Some(reason.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == QuoteStatus::Ok
    }
}
