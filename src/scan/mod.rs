//! Ticker scan: one polling cycle over many (pair, exchange) combinations.
//!
//! A cycle selects pairs, plans which symbols each exchange is due to
//! refresh, fetches them concurrently through the outbound limiter, and only
//! then aggregates per pair into best-buy/best-sell updates.

pub mod analysis;

use crate::config::ScanConfig;
use crate::controller::OutboundLimiter;
use crate::errors::GatewayError;
use crate::gateway::ExchangeGateway;
use crate::models::{ExchangeId, Pair, Ticker};
use crate::utils::median;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

pub type PairExchangeMap = BTreeMap<Pair, BTreeSet<ExchangeId>>;

/// Best cross-exchange prices for one pair after filtering.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TickerScanUpdate {
    pub pair: Pair,
    pub best_buy_exchange: ExchangeId,
    pub buy_ask: f64,
    pub best_sell_exchange: ExchangeId,
    pub sell_bid: f64,
    pub spread_abs: f64,
    /// Relative to the mid of `buy_ask` and `sell_bid`.
    pub spread_pct: Option<f64>,
    pub volume_24h: Option<f64>,
    pub exchange_count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TickerScanResult {
    pub updates: Vec<TickerScanUpdate>,
    pub pair_count: usize,
    /// Ticker fetches that succeeded this cycle.
    pub ok_count: usize,
    pub fail_count: usize,
    /// Pairs with fewer than two usable venues.
    pub skipped_count: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScanRequest {
    pub max_pairs: usize,
    /// Takes precedence over the full catalogue when set.
    pub candidates: Option<Vec<Pair>>,
    pub max_intrabook_spread_pct: Option<f64>,
    pub outlier_pct: f64,
}

impl ScanRequest {
    pub fn from_config(config: &ScanConfig) -> Self {
        Self {
            max_pairs: config.max_pairs,
            candidates: None,
            max_intrabook_spread_pct: config.max_intrabook_spread_pct,
            outlier_pct: config.outlier_pct,
        }
    }
}

/// One venue's usable prices for a pair.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceEntry {
    pub exchange: ExchangeId,
    pub bid: f64,
    pub ask: f64,
    pub mid: f64,
    pub volume: Option<f64>,
}

impl PriceEntry {
    /// `None` unless both sides are positive.
    pub fn from_ticker(exchange: ExchangeId, ticker: &Ticker) -> Option<Self> {
        let bid = ticker.bid.filter(|bid| *bid > 0.0)?;
        let ask = ticker.ask.filter(|ask| *ask > 0.0)?;
        Some(Self {
            exchange,
            bid,
            ask,
            mid: (bid + ask) / 2.0,
            volume: ticker.volume(),
        })
    }

    pub fn intrabook_spread_pct(&self) -> f64 {
        (self.ask - self.bid) / self.mid * 100.0
    }
}

struct FetchRecord {
    at: Instant,
    ticker: Option<Ticker>,
}

#[derive(Default)]
struct ScanState {
    last_fetch: HashMap<(ExchangeId, String), FetchRecord>,
    // next position in the full symbol list, for exchanges fetched symbol by symbol
    offsets: HashMap<ExchangeId, usize>,
}

type FetchOutcome = (String, Result<Ticker, GatewayError>);

pub struct TickerScanService {
    gateway: Arc<dyn ExchangeGateway>,
    limiter: OutboundLimiter,
    min_refresh_interval: Duration,
    batch_size: usize,
    state: Mutex<ScanState>,
}

impl TickerScanService {
    pub fn new(
        gateway: Arc<dyn ExchangeGateway>,
        limiter: OutboundLimiter,
        config: &ScanConfig,
    ) -> Self {
        Self {
            gateway,
            limiter,
            min_refresh_interval: config.min_refresh_interval,
            batch_size: config.batch_size.max(1),
            state: Mutex::new(ScanState::default()),
        }
    }

    pub async fn scan(&self, pair_exchanges: &PairExchangeMap, request: &ScanRequest) -> TickerScanResult {
        let pairs: Vec<Pair> = match &request.candidates {
            Some(candidates) => candidates.iter().take(request.max_pairs).cloned().collect(),
            None => pair_exchanges.keys().take(request.max_pairs).cloned().collect(),
        };

        let mut wanted: BTreeMap<ExchangeId, Vec<String>> = BTreeMap::new();
        for pair in &pairs {
            for exchange in pair_exchanges.get(pair).into_iter().flatten() {
                wanted
                    .entry(exchange.clone())
                    .or_default()
                    .push(pair.to_string());
            }
        }

        let plan = self.plan(wanted, Instant::now());
        let fetched = join_all(
            plan.into_iter()
                .map(|(exchange, symbols)| self.fetch_exchange(exchange, symbols)),
        )
        .await;

        let mut result = TickerScanResult {
            pair_count: pairs.len(),
            ..TickerScanResult::default()
        };
        let now = Instant::now();
        let mut state = self.state.lock();
        for (exchange, outcomes) in fetched {
            for (symbol, outcome) in outcomes {
                let ticker = match outcome {
                    Ok(ticker) => {
                        result.ok_count += 1;
                        Some(ticker)
                    }
                    Err(err) => {
                        result.fail_count += 1;
                        let message = format!("Ticker error: {exchange} {symbol}: {err}");
                        debug!(%message, "[SCAN] fetch failed");
                        result.errors.push(message);
                        None
                    }
                };
                state
                    .last_fetch
                    .insert((exchange.clone(), symbol), FetchRecord { at: now, ticker });
            }
        }

        for pair in &pairs {
            let symbol = pair.to_string();
            let entries: Vec<PriceEntry> = pair_exchanges
                .get(pair)
                .into_iter()
                .flatten()
                .filter_map(|exchange| {
                    let record = state.last_fetch.get(&(exchange.clone(), symbol.clone()))?;
                    PriceEntry::from_ticker(exchange.clone(), record.ticker.as_ref()?)
                })
                .collect();
            match summarize_pair(pair, entries, request.outlier_pct, request.max_intrabook_spread_pct) {
                Some(update) => result.updates.push(update),
                None => result.skipped_count += 1,
            }
        }
        drop(state);

        debug!(
            pairs = result.pair_count,
            ok = result.ok_count,
            failed = result.fail_count,
            skipped = result.skipped_count,
            "[SCAN] cycle finished"
        );
        result
    }

    /// Per exchange, the symbols actually fetched this cycle: only those past
    /// the refresh interval, and for non-batch venues at most `batch_size`
    /// taken round-robin.
    ///
    /// The rotation cursor is a position in the exchange's full symbol list,
    /// so symbols skipped by the throttle keep their turn.
    fn plan(
        &self,
        wanted: BTreeMap<ExchangeId, Vec<String>>,
        now: Instant,
    ) -> Vec<(ExchangeId, Vec<String>)> {
        let mut guard = self.state.lock();
        let ScanState { last_fetch, offsets } = &mut *guard;
        let mut plan = Vec::new();
        for (exchange, symbols) in wanted {
            let is_due = |symbol: &String| {
                last_fetch
                    .get(&(exchange.clone(), symbol.clone()))
                    .is_none_or(|record| now.duration_since(record.at) >= self.min_refresh_interval)
            };

            let due: Vec<String> = if self.gateway.supports_batch(&exchange) {
                symbols.iter().filter(|s| is_due(s)).cloned().collect()
            } else {
                let len = symbols.len();
                let start = offsets.get(&exchange).copied().unwrap_or(0) % len.max(1);
                let mut picked = Vec::new();
                let mut next = start;
                for step in 0..len {
                    if picked.len() == self.batch_size {
                        break;
                    }
                    let idx = (start + step) % len;
                    if is_due(&symbols[idx]) {
                        picked.push(symbols[idx].clone());
                        next = (idx + 1) % len;
                    }
                }
                offsets.insert(exchange.clone(), next);
                picked
            };
            if due.is_empty() {
                continue;
            }
            plan.push((exchange, due));
        }
        plan
    }

    async fn fetch_exchange(
        &self,
        exchange: ExchangeId,
        symbols: Vec<String>,
    ) -> (ExchangeId, Vec<FetchOutcome>) {
        if self.gateway.supports_batch(&exchange) {
            let batch = self
                .limiter
                .run(self.gateway.fetch_tickers(&exchange, &symbols))
                .await;
            let outcomes = match batch {
                Ok(mut tickers) => symbols
                    .into_iter()
                    .map(|symbol| {
                        let outcome = tickers
                            .remove(&symbol)
                            .ok_or_else(|| GatewayError::NoSymbol(symbol.clone()));
                        (symbol, outcome)
                    })
                    .collect(),
                Err(err) => symbols
                    .into_iter()
                    .map(|symbol| (symbol, Err(err.clone())))
                    .collect(),
            };
            return (exchange, outcomes);
        }

        let outcomes = join_all(symbols.into_iter().map(|symbol| {
            let exchange = &exchange;
            async move {
                let outcome = self
                    .limiter
                    .run(self.gateway.fetch_ticker(exchange, &symbol))
                    .await;
                (symbol, outcome)
            }
        }))
        .await;
        (exchange, outcomes)
    }
}

/// Filters one pair's entries and picks the best prices. `None` when fewer
/// than two venues survive.
pub fn summarize_pair(
    pair: &Pair,
    entries: Vec<PriceEntry>,
    outlier_pct: f64,
    max_intrabook_spread_pct: Option<f64>,
) -> Option<TickerScanUpdate> {
    if entries.len() < 2 {
        return None;
    }
    let mids: Vec<f64> = entries.iter().map(|e| e.mid).collect();
    let consensus = median(&mids)?;
    let mut entries: Vec<PriceEntry> = entries
        .into_iter()
        .filter(|e| ((e.mid - consensus) / consensus * 100.0).abs() <= outlier_pct)
        .collect();
    if let Some(max_spread) = max_intrabook_spread_pct {
        entries.retain(|e| e.intrabook_spread_pct() <= max_spread);
    }
    if entries.len() < 2 {
        return None;
    }

    let mut buy = &entries[0];
    let mut sell = &entries[0];
    for entry in &entries[1..] {
        if entry.ask < buy.ask {
            buy = entry;
        }
        if entry.bid > sell.bid {
            sell = entry;
        }
    }

    let spread_abs = sell.bid - buy.ask;
    let mid = (sell.bid + buy.ask) / 2.0;
    let spread_pct = (mid > 0.0).then(|| spread_abs / mid * 100.0);
    let volumes: Vec<f64> = entries.iter().filter_map(|e| e.volume).collect();

    Some(TickerScanUpdate {
        pair: pair.clone(),
        best_buy_exchange: buy.exchange.clone(),
        buy_ask: buy.ask,
        best_sell_exchange: sell.exchange.clone(),
        sell_bid: sell.bid,
        spread_abs,
        spread_pct,
        volume_24h: median(&volumes),
        exchange_count: entries.len(),
    })
}
