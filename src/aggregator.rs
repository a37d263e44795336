//! Quote board and the live pair monitor that evaluates it every second.

use crate::arbitrage::{AnalyzerParams, ArbitrageResult, analyze};
use crate::config::MonitorConfig;
use crate::controller::JobController;
use crate::fallback::FallbackCoordinator;
use crate::models::{ExchangeId, Pair, QuoteSnapshot, QuoteSource, QuoteStatus};
use crate::resolver::PriceResolver;
use crate::stream::{StreamEvent, StreamManager};
use crate::utils::local_timestamp;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

// The monitor lives for one run; polls still in flight at shutdown land in a
// closed channel.
const MONITOR_RUN: u64 = 1;

/// Latest snapshot per exchange for one pair.
#[derive(Debug, Clone)]
pub struct QuoteBoard {
    pair: Pair,
    quotes: BTreeMap<ExchangeId, QuoteSnapshot>,
}

impl QuoteBoard {
    pub fn new(pair: Pair) -> Self {
        Self {
            pair,
            quotes: BTreeMap::new(),
        }
    }

    pub fn pair(&self) -> &Pair {
        &self.pair
    }

    /// Replaces the exchange's previous snapshot. Snapshots for another pair
    /// are refused.
    pub fn update(&mut self, snapshot: QuoteSnapshot) -> bool {
        if snapshot.pair != self.pair {
            return false;
        }
        self.quotes.insert(snapshot.exchange.clone(), snapshot);
        true
    }

    pub fn get(&self, exchange: &ExchangeId) -> Option<&QuoteSnapshot> {
        self.quotes.get(exchange)
    }

    pub fn snapshots(&self) -> Vec<QuoteSnapshot> {
        self.quotes.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.quotes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.quotes.is_empty()
    }

    pub fn ok_count(&self) -> usize {
        self.quotes.values().filter(|quote| quote.is_ok()).count()
    }
}

/// Running monitor; dropping it leaves the task running until `shutdown`.
pub struct PairMonitor {
    board: Arc<Mutex<QuoteBoard>>,
    results: watch::Receiver<ArbitrageResult>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PairMonitor {
    pub fn board(&self) -> QuoteBoard {
        self.board.lock().clone()
    }

    /// Receives the analysis of every evaluation tick.
    pub fn results(&self) -> watch::Receiver<ArbitrageResult> {
        self.results.clone()
    }

    /// Stops streaming and the evaluation loop, waiting for both to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

/// Spawn the pair monitor loop.
///
/// Streaming updates flow into the board as they arrive. Once per second the
/// monitor asks the fallback coordinator which exchanges need HTTP polling,
/// submits that poll as job `fallback:<pair>` when a resolver is available
/// and streaming-only mode is off, then analyzes the board.
pub async fn spawn_pair_monitor(
    config: MonitorConfig,
    mut manager: StreamManager,
    mut stream_rx: mpsc::UnboundedReceiver<StreamEvent>,
    controller: JobController,
    resolver: Option<PriceResolver>,
) -> PairMonitor {
    let board = Arc::new(Mutex::new(QuoteBoard::new(config.pair.clone())));
    let (results_tx, results_rx) = watch::channel(ArbitrageResult::default());
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let streaming = manager.start(&config.pair, &config.exchanges).await;
    tracing::info!(
        pair = %config.pair,
        exchanges = config.exchanges.len(),
        streaming = streaming.len(),
        only_ws = config.only_ws,
        "[INIT] pair monitor started"
    );

    let task_board = board.clone();
    let task = tokio::spawn(async move {
        let board = task_board;
        let pair = config.pair.clone();
        let job_key = format!("fallback:{pair}");
        let mut fallback = FallbackCoordinator::new(config.stale_after, streaming, Instant::now());
        let (http_tx, mut http_rx) = mpsc::unbounded_channel::<Vec<QuoteSnapshot>>();
        let params = AnalyzerParams {
            min_spread_pct: config.min_spread_pct,
            source_filter: config.only_ws.then_some(QuoteSource::Ws),
            top_n: config.top_n,
        };
        let http_fallback = resolver.filter(|_| !config.only_ws);

        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        let mut ticks: u64 = 0;

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                Some(event) = stream_rx.recv() => match event {
                    StreamEvent::Quote(snapshot) => {
                        fallback.record_ws(&snapshot.exchange, Instant::now());
                        board.lock().update(snapshot);
                    }
                    StreamEvent::Failed { exchange, message } => {
                        fallback.mark_failed(&exchange);
                        board.lock().update(QuoteSnapshot::failed(
                            exchange,
                            pair.clone(),
                            QuoteStatus::Error,
                            message,
                            QuoteSource::Ws,
                            local_timestamp(),
                        ));
                    }
                },
                Some(quotes) = http_rx.recv() => {
                    // a stream that recovered meanwhile stays authoritative
                    let still_needed = fallback.exchanges_needing_http(&config.exchanges, Instant::now());
                    let mut board = board.lock();
                    for quote in quotes {
                        if still_needed.contains(&quote.exchange) {
                            board.update(quote);
                        }
                    }
                }
                _ = ticker.tick() => {
                    ticks += 1;
                    if let Some(resolver) = &http_fallback {
                        let needed = fallback.exchanges_needing_http(&config.exchanges, Instant::now());
                        if !needed.is_empty() {
                            submit_fallback(&controller, &job_key, resolver, &pair, needed, &http_tx);
                        }
                    }

                    let quotes = board.lock().snapshots();
                    let result = analyze(&quotes, &params);
                    log_result(&pair, &result, &quotes, ticks);
                    let _ = results_tx.send(result);
                }
            }
        }

        controller.clear_key(&job_key);
        manager.stop().await;
        tracing::info!(%pair, "[HEARTBEAT] pair monitor stopped");
    });

    PairMonitor {
        board,
        results: results_rx,
        shutdown: shutdown_tx,
        task,
    }
}

fn submit_fallback(
    controller: &JobController,
    job_key: &str,
    resolver: &PriceResolver,
    pair: &Pair,
    exchanges: Vec<ExchangeId>,
    http_tx: &mpsc::UnboundedSender<Vec<QuoteSnapshot>>,
) {
    let resolver = resolver.clone();
    let fetch_pair = pair.clone();
    let Some(handle) = controller.submit(job_key, MONITOR_RUN, async move {
        Ok(resolver.fetch_quotes(&fetch_pair, &exchanges).await)
    }) else {
        // previous poll still running
        return;
    };
    let http_tx = http_tx.clone();
    tokio::spawn(async move {
        let run_id = handle.run_id();
        match handle.outcome().await {
            Ok(quotes) => {
                let _ = http_tx.send(quotes);
            }
            Err(message) => tracing::warn!(run_id, %message, "[JOB] fallback poll failed"),
        }
    });
}

fn log_result(pair: &Pair, result: &ArbitrageResult, quotes: &[QuoteSnapshot], ticks: u64) {
    if !result.opportunities.is_empty() {
        let opportunity_logs: Vec<String> = result
            .opportunities
            .iter()
            .map(|opp| {
                format!(
                    "Buy {} @ {:.8} -> Sell {} @ {:.8} | {:.4}%",
                    opp.buy_exchange, opp.buy_ask, opp.sell_exchange, opp.sell_bid, opp.spread_pct
                )
            })
            .collect();
        tracing::info!(%pair, opps = ?opportunity_logs, "[OPP] opportunities found");
    } else if ticks % 5 == 0 {
        let ok = quotes.iter().filter(|quote| quote.is_ok()).count();
        match (&result.best_buy, &result.best_sell) {
            (Some(buy), Some(sell)) => tracing::info!(
                %pair,
                quotes = ok,
                best_ask = buy.ask,
                best_bid = sell.bid,
                spread_pct = result.spread_pct,
                "[HEARTBEAT] no opps above threshold"
            ),
            _ => tracing::info!(%pair, quotes = quotes.len(), "[HEARTBEAT] waiting for quotes"),
        }
    }
}
