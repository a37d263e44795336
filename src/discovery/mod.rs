//! Market discovery: turns a set of exchanges into the catalogue of pairs
//! listed as active spot markets on enough of them.

pub mod cache;

pub use cache::{MarketCache, MarketCacheEntry};

use crate::controller::OutboundLimiter;
use crate::errors::{AppError, Result};
use crate::gateway::ExchangeGateway;
use crate::models::{ExchangeId, MarketDescriptor, Pair, split_symbol};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{info, warn};

pub type CancelSignal<'a> = &'a (dyn Fn() -> bool + Send + Sync);
pub type ProgressCallback<'a> = &'a (dyn Fn(usize, usize) + Send + Sync);

/// Eligible pairs and the exchanges listing each of them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiscoveryResult {
    /// Only pairs listed on at least `min_exchanges` exchanges.
    pub pair_exchanges: BTreeMap<Pair, BTreeSet<ExchangeId>>,
    pub eligible_pairs: Vec<Pair>,
    /// Filtered market count per exchange that loaded successfully.
    pub exchange_counts: BTreeMap<ExchangeId, usize>,
    pub errors: Vec<String>,
}

pub struct MarketDiscoveryService {
    gateway: Arc<dyn ExchangeGateway>,
    cache: Option<MarketCache>,
    limiter: OutboundLimiter,
}

impl MarketDiscoveryService {
    pub fn new(
        gateway: Arc<dyn ExchangeGateway>,
        cache: Option<MarketCache>,
        limiter: OutboundLimiter,
    ) -> Self {
        Self {
            gateway,
            cache,
            limiter,
        }
    }

    /// Loads every exchange's catalogue and builds the eligible pair index.
    ///
    /// One exchange failing only removes its pairs; discovery fails as a whole
    /// when every requested exchange failed. `cancel` is polled between
    /// exchanges and aborts with [`AppError::Cancelled`].
    pub async fn discover(
        &self,
        exchanges: &[ExchangeId],
        quotes: &[String],
        min_exchanges: usize,
        cancel: Option<CancelSignal<'_>>,
        progress: Option<ProgressCallback<'_>>,
    ) -> Result<DiscoveryResult> {
        let quotes: HashSet<String> = quotes.iter().map(|q| q.to_uppercase()).collect();
        let is_cancelled = || cancel.is_some_and(|cancel| cancel());

        let mut listed: BTreeMap<Pair, BTreeSet<ExchangeId>> = BTreeMap::new();
        let mut exchange_counts = BTreeMap::new();
        let mut errors = Vec::new();
        let total = exchanges.len();

        for (done, exchange) in exchanges.iter().enumerate() {
            if is_cancelled() {
                info!(done, total, "[DISCOVERY] cancelled");
                return Err(AppError::Cancelled);
            }
            match self.markets_for(exchange).await {
                Ok(markets) => {
                    let symbols = filter_markets(&markets, &quotes);
                    info!(%exchange, markets = symbols.len(), "[DISCOVERY] markets loaded");
                    exchange_counts.insert(exchange.clone(), symbols.len());
                    for symbol in symbols {
                        listed
                            .entry(Pair::new(symbol))
                            .or_default()
                            .insert(exchange.clone());
                    }
                }
                Err(err) => {
                    warn!(%exchange, error = %err, "[DISCOVERY] market load failed");
                    errors.push(format!("{exchange}: {err}"));
                }
            }
            if let Some(progress) = progress {
                progress(done + 1, total);
            }
        }

        if is_cancelled() {
            return Err(AppError::Cancelled);
        }
        if total > 0 && errors.len() == total {
            return Err(AppError::DiscoveryUnavailable(errors.join("; ")));
        }

        listed.retain(|_, venues| venues.len() >= min_exchanges);
        let eligible_pairs: Vec<Pair> = listed.keys().cloned().collect();
        info!(
            eligible = eligible_pairs.len(),
            min_exchanges, "[DISCOVERY] candidates built"
        );

        Ok(DiscoveryResult {
            pair_exchanges: listed,
            eligible_pairs,
            exchange_counts,
            errors,
        })
    }

    async fn markets_for(&self, exchange: &ExchangeId) -> Result<Vec<MarketDescriptor>> {
        if let Some(markets) = self.cache.as_ref().and_then(|c| c.load(exchange)) {
            return Ok(markets);
        }
        let markets = self
            .limiter
            .run(self.gateway.load_markets(exchange))
            .await?;
        if let Some(cache) = &self.cache {
            cache.save(exchange, &markets);
        }
        Ok(markets)
    }
}

/// Symbols of active spot markets quoted in one of `quotes`.
pub fn filter_markets(markets: &[MarketDescriptor], quotes: &HashSet<String>) -> BTreeSet<String> {
    markets
        .iter()
        .filter(|m| is_eligible(m, quotes))
        .map(|m| m.symbol.clone())
        .collect()
}

fn is_eligible(market: &MarketDescriptor, quotes: &HashSet<String>) -> bool {
    let symbol = market.symbol.as_str();
    // BASE/QUOTE:SETTLE is a derivative
    if symbol.is_empty() || symbol.contains(':') {
        return false;
    }
    let Some((_, symbol_quote)) = split_symbol(symbol) else {
        return false;
    };
    if market.spot == Some(false) || market.active == Some(false) {
        return false;
    }
    if market.contract || market.future || market.swap || market.margin {
        return false;
    }
    let quote = market
        .quote
        .as_deref()
        .filter(|q| !q.is_empty())
        .unwrap_or(symbol_quote);
    quotes.contains(&quote.to_uppercase())
}
