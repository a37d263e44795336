//! Scanner session: market discovery followed by periodic ticker scans, with
//! run epochs making every stale completion inert.

use crate::config::{DiscoveryConfig, ScanConfig};
use crate::controller::{JobController, RunEpoch};
use crate::discovery::{DiscoveryResult, MarketDiscoveryService};
use crate::errors::{AppError, Result};
use crate::models::{ExchangeId, Pair};
use crate::scan::analysis::PairAnalysisSnapshot;
use crate::scan::{PairExchangeMap, ScanRequest, TickerScanResult, TickerScanService, TickerScanUpdate};
use crate::utils::local_timestamp;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

pub const DISCOVERY_JOB: &str = "discovery";
pub const SCAN_JOB: &str = "ticker-scan";

/// What one `start` call scans.
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub exchanges: Vec<ExchangeId>,
    pub quotes: Vec<String>,
    pub min_exchanges: usize,
    pub interval: Duration,
    pub request: ScanRequest,
    pub threshold_pct: f64,
}

impl SessionParams {
    pub fn new(exchanges: Vec<ExchangeId>, discovery: &DiscoveryConfig, scan: &ScanConfig) -> Self {
        Self {
            exchanges,
            quotes: discovery.quotes.clone(),
            min_exchanges: discovery.min_exchanges,
            interval: scan.interval,
            request: ScanRequest::from_config(scan),
            threshold_pct: scan.opportunity_threshold_pct,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionStatus {
    Stopped,
    Discovery { done: usize, total: usize },
    Scanning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RowStatus {
    Live,
    /// Was profitable earlier, below the threshold now.
    Faded,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProfitRow {
    pub pair: Pair,
    pub best_buy_exchange: ExchangeId,
    pub buy_ask: f64,
    pub best_sell_exchange: ExchangeId,
    pub sell_bid: f64,
    pub spread_abs: f64,
    pub spread_pct: Option<f64>,
    pub volume_24h: Option<f64>,
    pub status: RowStatus,
}

impl ProfitRow {
    fn from_update(update: &TickerScanUpdate, status: RowStatus) -> Self {
        Self {
            pair: update.pair.clone(),
            best_buy_exchange: update.best_buy_exchange.clone(),
            buy_ask: update.buy_ask,
            best_sell_exchange: update.best_sell_exchange.clone(),
            sell_bid: update.sell_bid,
            spread_abs: update.spread_abs,
            spread_pct: update.spread_pct,
            volume_24h: update.volume_24h,
            status,
        }
    }
}

/// Merges one cycle's updates into the rows: at or above the threshold a pair
/// is inserted or refreshed as live, below it an existing row fades.
pub fn merge_profit_rows(rows: &mut Vec<ProfitRow>, updates: &[TickerScanUpdate], threshold_pct: f64) {
    for update in updates {
        let profitable = update.spread_pct.is_some_and(|pct| pct >= threshold_pct);
        let existing = rows.iter_mut().find(|row| row.pair == update.pair);
        match (existing, profitable) {
            (Some(row), true) => *row = ProfitRow::from_update(update, RowStatus::Live),
            (Some(row), false) => *row = ProfitRow::from_update(update, RowStatus::Faded),
            (None, true) => rows.push(ProfitRow::from_update(update, RowStatus::Live)),
            (None, false) => {}
        }
    }
}

#[derive(Debug, Clone, Default)]
struct SessionState {
    status: Option<SessionStatus>,
    pair_exchanges: PairExchangeMap,
    eligible_pairs: Vec<Pair>,
    rows: Vec<ProfitRow>,
    last_result: Option<TickerScanResult>,
    last_latency: Option<Duration>,
    last_error: Option<String>,
    last_updated: Option<String>,
}

struct Inner {
    controller: JobController,
    discovery: MarketDiscoveryService,
    scanner: TickerScanService,
    epoch: RunEpoch,
    cancel: Mutex<Arc<AtomicBool>>,
    state: Mutex<SessionState>,
    scan_loop: Mutex<Option<JoinHandle<()>>>,
}

/// Consumer-facing lifecycle of scanner mode; cheap to clone.
#[derive(Clone)]
pub struct ScannerSession {
    inner: Arc<Inner>,
}

impl ScannerSession {
    pub fn new(
        controller: JobController,
        discovery: MarketDiscoveryService,
        scanner: TickerScanService,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                controller,
                discovery,
                scanner,
                epoch: RunEpoch::new(),
                cancel: Mutex::new(Arc::new(AtomicBool::new(false))),
                state: Mutex::new(SessionState::default()),
                scan_loop: Mutex::new(None),
            }),
        }
    }

    /// Stops whatever ran before, then submits discovery. Returns the new run id.
    pub fn start(&self, params: SessionParams) -> Result<u64> {
        self.stop();
        let run_id = self.inner.epoch.advance();
        let cancel = Arc::new(AtomicBool::new(false));
        *self.inner.cancel.lock() = cancel.clone();
        self.inner.state.lock().status = Some(SessionStatus::Discovery {
            done: 0,
            total: params.exchanges.len(),
        });

        let inner = self.inner.clone();
        let exchanges = params.exchanges.clone();
        let quotes = params.quotes.clone();
        let min_exchanges = params.min_exchanges;
        let job = async move {
            let is_cancelled = move || cancel.load(Ordering::SeqCst);
            let progress_inner = inner.clone();
            let on_progress = move |done: usize, total: usize| {
                if progress_inner.epoch.is_current(run_id) {
                    progress_inner.state.lock().status = Some(SessionStatus::Discovery { done, total });
                }
            };
            inner
                .discovery
                .discover(&exchanges, &quotes, min_exchanges, Some(&is_cancelled), Some(&on_progress))
                .await
        };
        let Some(handle) = self.inner.controller.submit(DISCOVERY_JOB, run_id, job) else {
            return Err(AppError::Job(format!("{DISCOVERY_JOB} already in flight")));
        };
        info!(run_id, exchanges = params.exchanges.len(), "[DISCOVERY] session started");

        let session = self.clone();
        tokio::spawn(async move {
            let outcome = handle.outcome().await;
            session.on_discovery(run_id, params, outcome);
        });
        Ok(run_id)
    }

    fn on_discovery(&self, run_id: u64, params: SessionParams, outcome: std::result::Result<DiscoveryResult, String>) {
        if !self.inner.epoch.is_current(run_id) {
            debug!(run_id, "[DISCOVERY] stale result dropped");
            return;
        }
        let result = match outcome {
            Ok(result) => result,
            Err(message) => {
                warn!(run_id, error = %message, "[DISCOVERY] failed");
                let mut state = self.inner.state.lock();
                state.status = Some(SessionStatus::Stopped);
                state.last_error = Some(message);
                return;
            }
        };

        info!(
            run_id,
            candidates = result.eligible_pairs.len(),
            min_exchanges = params.min_exchanges,
            "[DISCOVERY] catalogue ready"
        );

        let scan_ready = !result.eligible_pairs.is_empty() && params.exchanges.len() >= params.min_exchanges;
        {
            let mut state = self.inner.state.lock();
            state.pair_exchanges = result.pair_exchanges;
            state.eligible_pairs = result.eligible_pairs;
            state.rows.clear();
            state.last_updated = Some(local_timestamp());
            state.status = Some(if scan_ready {
                SessionStatus::Scanning
            } else {
                SessionStatus::Stopped
            });
        }

        if !scan_ready {
            warn!(
                run_id,
                exchanges = params.exchanges.len(),
                min_exchanges = params.min_exchanges,
                "[SCAN] not started: no eligible pairs or too few exchanges"
            );
            return;
        }
        let handle = tokio::spawn(self.clone().scan_loop(run_id, params));
        if let Some(previous) = self.inner.scan_loop.lock().replace(handle) {
            previous.abort();
        }
    }

    async fn scan_loop(self, run_id: u64, params: SessionParams) {
        let mut ticker = tokio::time::interval(params.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            run_id,
            pairs = params.request.max_pairs.min(self.inner.state.lock().eligible_pairs.len()),
            exchanges = params.exchanges.len(),
            "[SCAN] started"
        );
        loop {
            ticker.tick().await;
            if !self.inner.epoch.is_current(run_id) {
                break;
            }
            if self.inner.controller.is_in_flight(SCAN_JOB) {
                continue;
            }
            let (pair_exchanges, eligible) = {
                let state = self.inner.state.lock();
                (state.pair_exchanges.clone(), state.eligible_pairs.clone())
            };
            let request = ScanRequest {
                candidates: Some(eligible),
                ..params.request.clone()
            };
            let inner = self.inner.clone();
            let started = Instant::now();
            let Some(handle) = self.inner.controller.submit(SCAN_JOB, run_id, async move {
                Ok(inner.scanner.scan(&pair_exchanges, &request).await)
            }) else {
                continue;
            };
            let session = self.clone();
            let threshold = params.threshold_pct;
            tokio::spawn(async move {
                let outcome = handle.outcome().await;
                session.on_scan(run_id, outcome, started.elapsed(), threshold);
            });
        }
    }

    fn on_scan(
        &self,
        run_id: u64,
        outcome: std::result::Result<TickerScanResult, String>,
        latency: Duration,
        threshold_pct: f64,
    ) {
        if !self.inner.epoch.is_current(run_id) {
            debug!(run_id, "[SCAN] stale result dropped");
            return;
        }
        let mut state = self.inner.state.lock();
        state.last_latency = Some(latency);
        match outcome {
            Ok(result) => {
                merge_profit_rows(&mut state.rows, &result.updates, threshold_pct);
                state.last_error = result.errors.first().cloned();
                state.last_updated = Some(local_timestamp());
                info!(
                    ok = result.ok_count,
                    fail = result.fail_count,
                    skipped = result.skipped_count,
                    latency_ms = latency.as_millis() as u64,
                    first_error = state.last_error.as_deref().unwrap_or("-"),
                    "[SCAN] cycle applied"
                );
                state.last_result = Some(result);
            }
            Err(message) => {
                warn!(run_id, error = %message, "[SCAN] cycle failed");
                state.last_error = Some(message);
            }
        }
    }

    /// Invalidates the current run, cancels discovery between exchanges and
    /// stops the scan loop. Rows and the catalogue are kept.
    pub fn stop(&self) {
        self.inner.epoch.advance();
        self.inner.cancel.lock().store(true, Ordering::SeqCst);
        if let Some(handle) = self.inner.scan_loop.lock().take() {
            handle.abort();
        }
        // stale jobs may still finish; their results are dropped by run id
        self.inner.controller.clear_key(DISCOVERY_JOB);
        self.inner.controller.clear_key(SCAN_JOB);
        self.inner.state.lock().status = Some(SessionStatus::Stopped);
    }

    /// Stops and forgets rows, the catalogue and the last cycle.
    pub fn clear(&self) {
        self.stop();
        let mut state = self.inner.state.lock();
        *state = SessionState {
            status: Some(SessionStatus::Stopped),
            ..SessionState::default()
        };
    }

    pub fn status(&self) -> SessionStatus {
        self.inner.state.lock().status.unwrap_or(SessionStatus::Stopped)
    }

    pub fn rows(&self) -> Vec<ProfitRow> {
        self.inner.state.lock().rows.clone()
    }

    pub fn live_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .rows
            .iter()
            .filter(|row| row.status == RowStatus::Live)
            .count()
    }

    pub fn eligible_pairs(&self) -> Vec<Pair> {
        self.inner.state.lock().eligible_pairs.clone()
    }

    pub fn pair_exchanges(&self) -> PairExchangeMap {
        self.inner.state.lock().pair_exchanges.clone()
    }

    pub fn last_result(&self) -> Option<TickerScanResult> {
        self.inner.state.lock().last_result.clone()
    }

    pub fn last_latency(&self) -> Option<Duration> {
        self.inner.state.lock().last_latency
    }

    /// First error of the last applied cycle, or the discovery failure.
    pub fn last_error(&self) -> Option<String> {
        self.inner.state.lock().last_error.clone()
    }

    pub fn last_updated(&self) -> Option<String> {
        self.inner.state.lock().last_updated.clone()
    }

    /// Detailed view of one pair across the exchanges listing it.
    pub async fn analyze_pair(&self, pair: &Pair) -> Option<PairAnalysisSnapshot> {
        let exchanges: Vec<ExchangeId> = self
            .inner
            .state
            .lock()
            .pair_exchanges
            .get(pair)?
            .iter()
            .cloned()
            .collect();
        Some(self.inner.scanner.analyze_pair(pair, &exchanges).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControllerConfig;
    use crate::errors::GatewayError;
    use crate::gateway::ExchangeGateway;
    use crate::gateway::mock::MockGateway;

    fn update(pair: &str, spread_pct: Option<f64>) -> TickerScanUpdate {
        TickerScanUpdate {
            pair: pair.into(),
            best_buy_exchange: "A".into(),
            buy_ask: 100.0,
            best_sell_exchange: "B".into(),
            sell_bid: 100.5,
            spread_abs: 0.5,
            spread_pct,
            volume_24h: None,
            exchange_count: 2,
        }
    }

    fn session(gateway: Arc<MockGateway>, scan: &ScanConfig) -> ScannerSession {
        let controller = JobController::new(&ControllerConfig::default());
        let gateway: Arc<dyn ExchangeGateway> = gateway;
        let discovery = MarketDiscoveryService::new(gateway.clone(), None, controller.limiter());
        let scanner = TickerScanService::new(gateway, controller.limiter(), scan);
        ScannerSession::new(controller, discovery, scanner)
    }

    fn params(exchanges: &[&str], min_exchanges: usize, scan: &ScanConfig) -> SessionParams {
        let discovery = DiscoveryConfig {
            min_exchanges,
            ..DiscoveryConfig::default()
        };
        SessionParams::new(exchanges.iter().map(|e| ExchangeId::from(*e)).collect(), &discovery, scan)
    }

    fn fast_scan() -> ScanConfig {
        ScanConfig {
            interval: Duration::from_millis(50),
            min_refresh_interval: Duration::ZERO,
            opportunity_threshold_pct: 0.3,
            ..ScanConfig::default()
        }
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[test]
    fn rows_go_live_then_fade() {
        let mut rows = Vec::new();
        merge_profit_rows(&mut rows, &[update("BTC/USDT", Some(0.6)), update("ETH/USDT", Some(0.1))], 0.5);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, RowStatus::Live);

        merge_profit_rows(&mut rows, &[update("BTC/USDT", Some(0.2))], 0.5);
        assert_eq!(rows[0].status, RowStatus::Faded);
        assert_eq!(rows[0].spread_pct, Some(0.2));

        merge_profit_rows(&mut rows, &[update("BTC/USDT", None), update("SOL/USDT", Some(0.5))], 0.5);
        assert_eq!(rows[0].status, RowStatus::Faded);
        assert_eq!(rows[1].pair, Pair::from("SOL/USDT"));
        assert_eq!(rows[1].status, RowStatus::Live);
    }

    #[tokio::test]
    async fn discovery_then_scan_produces_live_rows() {
        let gateway = Arc::new(
            MockGateway::new()
                .with_markets("A", &["BTC/USDT", "ETH/USDT"])
                .with_markets("B", &["BTC/USDT"])
                .with_ticker("A", "BTC/USDT", 100.0, 100.1)
                .with_ticker("B", "BTC/USDT", 100.5, 100.6),
        );
        let scan = fast_scan();
        let session = session(gateway, &scan);
        session.start(params(&["A", "B"], 2, &scan)).unwrap();

        wait_until(|| !session.rows().is_empty()).await;
        assert_eq!(session.status(), SessionStatus::Scanning);
        assert_eq!(session.eligible_pairs(), vec![Pair::from("BTC/USDT")]);
        let row = &session.rows()[0];
        assert_eq!(row.status, RowStatus::Live);
        assert_eq!(row.best_buy_exchange, ExchangeId::from("A"));
        assert!(session.last_latency().is_some());
        assert_eq!(session.live_count(), 1);

        session.stop();
        assert_eq!(session.status(), SessionStatus::Stopped);
        assert_eq!(session.rows().len(), 1);
        session.clear();
        assert!(session.rows().is_empty());
        assert!(session.eligible_pairs().is_empty());
    }

    #[tokio::test]
    async fn no_eligible_pairs_skips_scanning() {
        let gateway = Arc::new(
            MockGateway::new()
                .with_markets("A", &["BTC/USDT"])
                .with_markets("B", &["ETH/USDT"]),
        );
        let scan = fast_scan();
        let session = session(gateway.clone(), &scan);
        session.start(params(&["A", "B"], 2, &scan)).unwrap();

        wait_until(|| session.last_updated().is_some()).await;
        assert_eq!(session.status(), SessionStatus::Stopped);
        assert!(session.eligible_pairs().is_empty());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(gateway.ticker_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn discovery_failure_is_reported() {
        let gateway = Arc::new(
            MockGateway::new().with_market_error("A", GatewayError::Transport("down".into())),
        );
        let scan = fast_scan();
        let session = session(gateway, &scan);
        session.start(params(&["A"], 1, &scan)).unwrap();
        wait_until(|| session.last_error().is_some()).await;
        assert_eq!(session.status(), SessionStatus::Stopped);
        assert!(session.last_error().unwrap().contains("down"));
    }

    #[tokio::test]
    async fn restart_keeps_only_the_current_run() {
        let gateway = Arc::new(
            MockGateway::new()
                .with_markets("A", &["BTC/USDT"])
                .with_markets("B", &["BTC/USDT"])
                .with_markets("C", &["ETH/USDT"])
                .with_markets("D", &["ETH/USDT"])
                .with_ticker("A", "BTC/USDT", 100.0, 100.1)
                .with_ticker("B", "BTC/USDT", 101.0, 101.1)
                .with_ticker("C", "ETH/USDT", 50.0, 50.05)
                .with_ticker("D", "ETH/USDT", 50.5, 50.55)
                .with_delay(Duration::from_millis(100)),
        );
        let scan = fast_scan();
        let session = session(gateway, &scan);
        let first = session.start(params(&["A", "B"], 2, &scan)).unwrap();
        let second = session.start(params(&["C", "D"], 2, &scan)).unwrap();
        assert!(second > first);

        wait_until(|| session.last_result().is_some()).await;
        // leave time for anything the first run still had in flight
        tokio::time::sleep(Duration::from_millis(300)).await;

        let eth = Pair::from("ETH/USDT");
        assert_eq!(session.status(), SessionStatus::Scanning);
        assert_eq!(session.eligible_pairs(), vec![eth.clone()]);
        assert!(!session.pair_exchanges().contains_key(&Pair::from("BTC/USDT")));
        assert!(session.rows().iter().all(|row| row.pair == eth));
        assert!(!session.rows().is_empty());
        let result = session.last_result().unwrap();
        assert!(result.updates.iter().all(|update| update.pair == eth));
        assert_eq!(session.last_error(), None);
        session.stop();
    }

    #[tokio::test]
    async fn scan_finishing_after_stop_is_ignored() {
        let gateway = Arc::new(
            MockGateway::new()
                .with_markets("A", &["BTC/USDT"])
                .with_markets("B", &["BTC/USDT"])
                .with_ticker("A", "BTC/USDT", 100.0, 100.1)
                .with_ticker("B", "BTC/USDT", 101.0, 101.1)
                .with_delay(Duration::from_millis(150)),
        );
        let scan = fast_scan();
        let session = session(gateway.clone(), &scan);
        session.start(params(&["A", "B"], 2, &scan)).unwrap();

        wait_until(|| gateway.ticker_calls.load(Ordering::SeqCst) > 0).await;
        session.stop();
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(session.status(), SessionStatus::Stopped);
        assert_eq!(session.eligible_pairs(), vec![Pair::from("BTC/USDT")]);
        assert!(session.last_result().is_none());
        assert!(session.last_latency().is_none());
        assert!(session.rows().is_empty());
    }

    #[test]
    fn stale_scan_outcome_leaves_state_untouched() {
        let session = session(Arc::new(MockGateway::new()), &fast_scan());
        let old_run = session.inner.epoch.advance();
        session.inner.epoch.advance();

        let result = TickerScanResult {
            updates: vec![update("BTC/USDT", Some(1.0))],
            ..TickerScanResult::default()
        };
        session.on_scan(old_run, Ok(result), Duration::from_millis(5), 0.3);
        session.on_scan(old_run, Err("late failure".into()), Duration::from_millis(5), 0.3);

        assert!(session.rows().is_empty());
        assert!(session.last_result().is_none());
        assert!(session.last_error().is_none());
        assert!(session.last_latency().is_none());
    }
}
