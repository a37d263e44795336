//! Single-pair analysis with a fee and slippage adjusted profit estimate.

use super::TickerScanService;
use crate::errors::GatewayError;
use crate::models::{ExchangeId, Pair, QuoteStatus};
use futures::future::join_all;
use serde::Serialize;

/// One exchange's row in a pair analysis.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PairExchangeTicker {
    pub exchange: ExchangeId,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub volume: Option<f64>,
    pub status: QuoteStatus,
}

impl PairExchangeTicker {
    /// Own book spread relative to the entry mid.
    pub fn intrabook_spread_pct(&self) -> Option<f64> {
        let (bid, ask) = (self.bid?, self.ask?);
        let mid = (bid + ask) / 2.0;
        (mid > 0.0).then(|| (ask - bid) / mid * 100.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PairAnalysisSnapshot {
    pub pair: Pair,
    pub entries: Vec<PairExchangeTicker>,
    pub best_buy_exchange: Option<ExchangeId>,
    pub buy_ask: Option<f64>,
    pub best_sell_exchange: Option<ExchangeId>,
    pub sell_bid: Option<f64>,
    pub spread_abs: Option<f64>,
    pub spread_pct: Option<f64>,
    pub errors: Vec<String>,
}

/// Trade sizing; fees and slippage are percentages.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NetParams {
    pub budget: f64,
    pub buy_fee_pct: f64,
    pub sell_fee_pct: f64,
    pub slippage_pct: f64,
}

impl Default for NetParams {
    fn default() -> Self {
        Self {
            budget: 1000.0,
            buy_fee_pct: 0.1,
            sell_fee_pct: 0.1,
            slippage_pct: 0.05,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct NetProfit {
    pub profit: f64,
    pub pct: f64,
}

impl PairAnalysisSnapshot {
    pub fn from_entries(pair: Pair, entries: Vec<PairExchangeTicker>, errors: Vec<String>) -> Self {
        let mut buy: Option<(&ExchangeId, f64)> = None;
        let mut sell: Option<(&ExchangeId, f64)> = None;
        for entry in &entries {
            if let Some(ask) = entry.ask.filter(|ask| *ask > 0.0) {
                if buy.is_none_or(|(_, best)| ask < best) {
                    buy = Some((&entry.exchange, ask));
                }
            }
            if let Some(bid) = entry.bid.filter(|bid| *bid > 0.0) {
                if sell.is_none_or(|(_, best)| bid > best) {
                    sell = Some((&entry.exchange, bid));
                }
            }
        }

        let (spread_abs, spread_pct) = match (buy, sell) {
            (Some((_, ask)), Some((_, bid))) => {
                let spread = bid - ask;
                let mid = (bid + ask) / 2.0;
                (Some(spread), (mid > 0.0).then(|| spread / mid * 100.0))
            }
            _ => (None, None),
        };

        Self {
            best_buy_exchange: buy.map(|(exchange, _)| exchange.clone()),
            buy_ask: buy.map(|(_, ask)| ask),
            best_sell_exchange: sell.map(|(exchange, _)| exchange.clone()),
            sell_bid: sell.map(|(_, bid)| bid),
            spread_abs,
            spread_pct,
            pair,
            entries,
            errors,
        }
    }

    /// Profit of buying `budget` worth at the best ask and selling at the
    /// best bid after fees and slippage on both legs.
    pub fn net(&self, params: &NetParams) -> Option<NetProfit> {
        let (buy_ask, sell_bid) = (self.buy_ask?, self.sell_bid?);
        let buy_fee = params.buy_fee_pct / 100.0;
        let sell_fee = params.sell_fee_pct / 100.0;
        let slippage = params.slippage_pct / 100.0;
        let buy_cost = params.budget * (1.0 + buy_fee + slippage);
        let sell_gain = params.budget * (1.0 - sell_fee - slippage);
        if buy_cost <= 0.0 {
            return None;
        }
        let profit = sell_bid / buy_ask * sell_gain - buy_cost;
        Some(NetProfit {
            profit,
            pct: profit / buy_cost * 100.0,
        })
    }
}

impl TickerScanService {
    /// Fresh tickers for one pair on every listed exchange. Bypasses the scan
    /// throttle but still goes through the outbound limiter.
    pub async fn analyze_pair(&self, pair: &Pair, exchanges: &[ExchangeId]) -> PairAnalysisSnapshot {
        let symbol = pair.to_string();
        let fetched = join_all(exchanges.iter().map(|exchange| {
            let symbol = &symbol;
            async move {
                let outcome = self
                    .limiter
                    .run(self.gateway.fetch_ticker(exchange, symbol))
                    .await;
                (exchange, outcome)
            }
        }))
        .await;

        let mut entries = Vec::with_capacity(fetched.len());
        let mut errors = Vec::new();
        for (exchange, outcome) in fetched {
            let entry = match outcome {
                Ok(ticker) => PairExchangeTicker {
                    exchange: exchange.clone(),
                    bid: ticker.bid,
                    ask: ticker.ask,
                    volume: ticker.volume(),
                    status: QuoteStatus::Ok,
                },
                Err(err) => {
                    errors.push(format!("Ticker error: {exchange} {symbol}: {err}"));
                    PairExchangeTicker {
                        exchange: exchange.clone(),
                        bid: None,
                        ask: None,
                        volume: None,
                        status: failure_status(&err),
                    }
                }
            };
            entries.push(entry);
        }
        PairAnalysisSnapshot::from_entries(pair.clone(), entries, errors)
    }
}

fn failure_status(err: &GatewayError) -> QuoteStatus {
    match err {
        GatewayError::NoSymbol(_) => QuoteStatus::NoSymbol,
        GatewayError::Timeout(_) => QuoteStatus::Timeout,
        _ => QuoteStatus::Error,
    }
}
