//! Staleness/fallback coordinator: decides which exchanges of a monitored
//! pair have to be polled over HTTP because streaming cannot serve them.

use crate::models::ExchangeId;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;

/// Tracks streaming liveness per exchange for the current run.
#[derive(Debug)]
pub struct FallbackCoordinator {
    stale_after: Duration,
    started_at: Instant,
    last_ws: HashMap<ExchangeId, Instant>,
    failed: HashSet<ExchangeId>,
    streaming: HashSet<ExchangeId>,
}

impl FallbackCoordinator {
    /// `streaming` lists the exchanges a stream was started for; everything
    /// else is served over HTTP from the start.
    pub fn new(
        stale_after: Duration,
        streaming: impl IntoIterator<Item = ExchangeId>,
        now: Instant,
    ) -> Self {
        Self {
            stale_after,
            started_at: now,
            last_ws: HashMap::new(),
            failed: HashSet::new(),
            streaming: streaming.into_iter().collect(),
        }
    }

    /// Forgets everything from the previous run. Streams get `stale_after`
    /// from `now` to deliver their first update.
    pub fn reset(&mut self, now: Instant) {
        self.started_at = now;
        self.last_ws.clear();
        self.failed.clear();
    }

    pub fn record_ws(&mut self, exchange: &ExchangeId, now: Instant) {
        self.last_ws.insert(exchange.clone(), now);
    }

    /// A failed stream is served over HTTP for the rest of the run.
    pub fn mark_failed(&mut self, exchange: &ExchangeId) {
        self.failed.insert(exchange.clone());
    }

    pub fn is_failed(&self, exchange: &ExchangeId) -> bool {
        self.failed.contains(exchange)
    }

    /// Exchanges without a stream, with a failed stream, or silent
    /// for longer than `stale_after`, in input order.
    pub fn exchanges_needing_http(&self, exchanges: &[ExchangeId], now: Instant) -> Vec<ExchangeId> {
        exchanges
            .iter()
            .filter(|exchange| self.needs_http(exchange, now))
            .cloned()
            .collect()
    }

    fn needs_http(&self, exchange: &ExchangeId, now: Instant) -> bool {
        if !self.streaming.contains(exchange) || self.failed.contains(exchange) {
            return true;
        }
        let last = self.last_ws.get(exchange).copied().unwrap_or(self.started_at);
        now.saturating_duration_since(last) > self.stale_after
    }
}
