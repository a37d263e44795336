use crate::models::{ExchangeId, QuoteSnapshot, QuoteSource};
use serde::Serialize;

/// Parameters for one analysis pass
#[derive(Debug, Clone)]
pub struct AnalyzerParams {
    pub min_spread_pct: f64,
    /// Only quotes from this source take part, e.g. streaming-only views.
    pub source_filter: Option<QuoteSource>,
    pub top_n: usize,
}

impl Default for AnalyzerParams {
    fn default() -> Self {
        Self {
            min_spread_pct: 0.0,
            source_filter: None,
            top_n: 10,
        }
    }
}

/// Buy on one exchange, sell on another
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Opportunity {
    pub buy_exchange: ExchangeId,
    pub buy_ask: f64,
    pub sell_exchange: ExchangeId,
    pub sell_bid: f64,
    /// `sell_bid - buy_ask`
    pub spread_abs: f64,
    /// Relative to `buy_ask`.
    pub spread_pct: f64,
}

/// Result of one analysis pass
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ArbitrageResult {
    pub best_buy: Option<QuoteSnapshot>,
    pub best_sell: Option<QuoteSnapshot>,
    pub spread_abs: f64,
    pub spread_pct: f64,
    pub opportunities: Vec<Opportunity>,
}
