//! Price resolution and per-exchange cooldowns.
//!
//! Owns every exchange's symbol cache and failure state. Other components
//! only see resolved symbols or finished [`QuoteSnapshot`]s.

use crate::config::CooldownConfig;
use crate::controller::OutboundLimiter;
use crate::errors::{GatewayError, ResolveError};
use crate::gateway::ExchangeGateway;
use crate::models::{ExchangeId, Pair, QuoteSnapshot, QuoteSource, QuoteStatus};
use crate::utils::local_timestamp;
use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Maps a canonical pair to the symbol a venue expects.
#[async_trait]
pub trait SymbolSource: Send + Sync {
    async fn venue_symbol(
        &self,
        exchange: &ExchangeId,
        pair: &Pair,
    ) -> std::result::Result<String, ResolveError>;
}

/// Uses the canonical pair unchanged; adapters translate it to wire form.
pub struct PassthroughSymbols;

#[async_trait]
impl SymbolSource for PassthroughSymbols {
    async fn venue_symbol(
        &self,
        _exchange: &ExchangeId,
        pair: &Pair,
    ) -> std::result::Result<String, ResolveError> {
        Ok(pair.to_string())
    }
}

enum Catalogue {
    Loading,
    Ready(Arc<HashSet<String>>),
}

#[derive(Default)]
struct ExchangeState {
    // None until the first request; reset to None after a failed load
    catalogue: Option<Catalogue>,
    symbols: HashMap<Pair, String>,
    no_symbol_until: HashMap<Pair, Instant>,
    error_until: Option<Instant>,
    last_error: Option<String>,
    last_error_logged_at: Option<Instant>,
}

impl ExchangeState {
    fn cooldown(&self, now: Instant) -> Option<ResolveError> {
        let until = self.error_until.filter(|until| *until > now)?;
        Some(ResolveError::Cooldown {
            message: self
                .last_error
                .clone()
                .unwrap_or_else(|| "exchange error".to_string()),
            remaining_secs: (until - now).as_secs_f64().ceil() as u64,
        })
    }

    fn record_error(
        &mut self,
        exchange: &ExchangeId,
        message: String,
        cooldown: Option<Duration>,
        log_window: Duration,
        now: Instant,
    ) {
        if let Some(cooldown) = cooldown {
            self.error_until = Some(now + cooldown);
        }
        if should_log(
            self.last_error.as_deref(),
            self.last_error_logged_at,
            &message,
            now,
            log_window,
        ) {
            warn!(%exchange, error = %message, "[RESOLVER] exchange error");
            self.last_error_logged_at = Some(now);
        }
        self.last_error = Some(message);
    }
}

/// An error is logged when it differs from the last one or the window passed.
fn should_log(
    last: Option<&str>,
    logged_at: Option<Instant>,
    message: &str,
    now: Instant,
    window: Duration,
) -> bool {
    last != Some(message) || logged_at.is_none_or(|at| now.duration_since(at) > window)
}

struct Inner {
    gateway: Arc<dyn ExchangeGateway>,
    limiter: OutboundLimiter,
    cooldown: CooldownConfig,
    exchanges: Mutex<HashMap<ExchangeId, ExchangeState>>,
}

#[derive(Clone)]
pub struct PriceResolver {
    inner: Arc<Inner>,
}

impl PriceResolver {
    pub fn new(
        gateway: Arc<dyn ExchangeGateway>,
        limiter: OutboundLimiter,
        cooldown: CooldownConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                gateway,
                limiter,
                cooldown,
                exchanges: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn is_ready(&self, exchange: &ExchangeId) -> bool {
        matches!(
            self.inner
                .exchanges
                .lock()
                .get(exchange)
                .and_then(|state| state.catalogue.as_ref()),
            Some(Catalogue::Ready(_))
        )
    }

    /// Resolves without waiting. A never-seen exchange starts loading its
    /// catalogue in the background and reports [`ResolveError::WarmingUp`].
    pub fn resolve_symbol(
        &self,
        exchange: &ExchangeId,
        pair: &Pair,
    ) -> std::result::Result<String, ResolveError> {
        let now = Instant::now();
        let mut exchanges = self.inner.exchanges.lock();
        let state = exchanges.entry(exchange.clone()).or_default();
        if let Some(cooldown) = state.cooldown(now) {
            return Err(cooldown);
        }
        if state.catalogue.is_none() {
            state.catalogue = Some(Catalogue::Loading);
            drop(exchanges);
            tokio::spawn(Self::load_catalogue(self.inner.clone(), exchange.clone()));
            return Err(ResolveError::WarmingUp);
        }
        let Some(Catalogue::Ready(catalogue)) = &state.catalogue else {
            return Err(ResolveError::WarmingUp);
        };
        let catalogue = catalogue.clone();

        if let Some(symbol) = state.symbols.get(pair) {
            return Ok(symbol.clone());
        }
        if state.no_symbol_until.get(pair).is_some_and(|until| *until > now) {
            return Err(ResolveError::NoSymbol(pair.to_string()));
        }
        for candidate in std::iter::once(pair.clone()).chain(pair.reversed()) {
            if catalogue.contains(candidate.as_str()) {
                state.no_symbol_until.remove(pair);
                state.symbols.insert(pair.clone(), candidate.to_string());
                return Ok(candidate.to_string());
            }
        }
        state
            .no_symbol_until
            .insert(pair.clone(), now + self.inner.cooldown.no_symbol);
        Err(ResolveError::NoSymbol(pair.to_string()))
    }

    /// Loads catalogues for `exchanges` that have none yet and waits for them.
    pub async fn warm_up(&self, exchanges: &[ExchangeId]) {
        let now = Instant::now();
        let pending: Vec<ExchangeId> = {
            let mut states = self.inner.exchanges.lock();
            exchanges
                .iter()
                .filter(|exchange| {
                    let state = states.entry((*exchange).clone()).or_default();
                    if state.catalogue.is_none() && state.cooldown(now).is_none() {
                        state.catalogue = Some(Catalogue::Loading);
                        true
                    } else {
                        false
                    }
                })
                .cloned()
                .collect()
        };
        join_all(
            pending
                .into_iter()
                .map(|exchange| Self::load_catalogue(self.inner.clone(), exchange)),
        )
        .await;
    }

    /// HTTP quotes for `pair` on every exchange, in the order given.
    pub async fn fetch_quotes(&self, pair: &Pair, exchanges: &[ExchangeId]) -> Vec<QuoteSnapshot> {
        join_all(
            exchanges
                .iter()
                .map(|exchange| self.fetch_quote(exchange.clone(), pair.clone())),
        )
        .await
    }

    async fn fetch_quote(&self, exchange: ExchangeId, pair: Pair) -> QuoteSnapshot {
        let symbol = match self.resolve_symbol(&exchange, &pair) {
            Ok(symbol) => symbol,
            Err(unresolved) => {
                return QuoteSnapshot::failed(
                    exchange,
                    pair,
                    unresolved.status(),
                    unresolved.to_string(),
                    QuoteSource::Http,
                    local_timestamp(),
                );
            }
        };

        let fetched = self
            .inner
            .limiter
            .run(self.inner.gateway.fetch_ticker(&exchange, &symbol))
            .await;
        match fetched {
            Ok(ticker) => match (ticker.bid, ticker.ask) {
                (Some(bid), Some(ask)) => QuoteSnapshot::ok(
                    exchange,
                    pair,
                    bid,
                    ask,
                    ticker.last.unwrap_or(0.0),
                    QuoteSource::Http,
                    local_timestamp(),
                ),
                _ => QuoteSnapshot::failed(
                    exchange,
                    pair,
                    QuoteStatus::Error,
                    "Incomplete ticker",
                    QuoteSource::Http,
                    local_timestamp(),
                ),
            },
            Err(err) => {
                let status = self.record_fetch_failure(&exchange, &pair, &err);
                QuoteSnapshot::failed(
                    exchange,
                    pair,
                    status,
                    err.to_string(),
                    QuoteSource::Http,
                    local_timestamp(),
                )
            }
        }
    }

    fn record_fetch_failure(
        &self,
        exchange: &ExchangeId,
        pair: &Pair,
        err: &GatewayError,
    ) -> QuoteStatus {
        let now = Instant::now();
        let cooldown = &self.inner.cooldown;
        let mut exchanges = self.inner.exchanges.lock();
        let state = exchanges.entry(exchange.clone()).or_default();
        match err {
            GatewayError::NoSymbol(_) => {
                state.symbols.remove(pair);
                state
                    .no_symbol_until
                    .insert(pair.clone(), now + cooldown.no_symbol);
                QuoteStatus::NoSymbol
            }
            _ => {
                let cooldown_for = err.is_transport().then_some(cooldown.error);
                state.record_error(
                    exchange,
                    err.to_string(),
                    cooldown_for,
                    cooldown.log_window,
                    now,
                );
                if matches!(err, GatewayError::Timeout(_)) {
                    QuoteStatus::Timeout
                } else {
                    QuoteStatus::Error
                }
            }
        }
    }

    async fn load_catalogue(inner: Arc<Inner>, exchange: ExchangeId) {
        let loaded = inner.limiter.run(inner.gateway.load_markets(&exchange)).await;
        let now = Instant::now();
        let mut exchanges = inner.exchanges.lock();
        let state = exchanges.entry(exchange.clone()).or_default();
        match loaded {
            Ok(markets) => {
                let symbols: HashSet<String> = markets.into_iter().map(|m| m.symbol).collect();
                info!(%exchange, symbols = symbols.len(), "[RESOLVER] catalogue loaded");
                state.catalogue = Some(Catalogue::Ready(Arc::new(symbols)));
            }
            Err(err) => {
                state.catalogue = None;
                state.record_error(
                    &exchange,
                    format!("Market load failed: {err}"),
                    Some(inner.cooldown.error),
                    inner.cooldown.log_window,
                    now,
                );
            }
        }
    }
}

#[async_trait]
impl SymbolSource for PriceResolver {
    async fn venue_symbol(
        &self,
        exchange: &ExchangeId,
        pair: &Pair,
    ) -> std::result::Result<String, ResolveError> {
        self.warm_up(std::slice::from_ref(exchange)).await;
        self.resolve_symbol(exchange, pair)
    }
}
