//! Streaming ingestion manager: one connection task per exchange for the
//! current pair, with per-exchange fault isolation.

use super::adapter::{StreamAdapter, adapter_for};
use super::connection::{Connection, ConnectionEvent, ConnectionEventKind};
use crate::controller::RunEpoch;
use crate::models::{ExchangeId, Pair, QuoteSnapshot};
use crate::resolver::SymbolSource;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const STOP_GRACE: Duration = Duration::from_secs(1);

/// What consumers receive from the manager.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Quote(QuoteSnapshot),
    /// The exchange's connection is gone (or never started) for this run.
    Failed { exchange: ExchangeId, message: String },
}

pub type AdapterLookup = fn(&ExchangeId) -> Option<&'static dyn StreamAdapter>;

type Connections = Arc<Mutex<HashMap<ExchangeId, JoinHandle<()>>>>;

struct ActiveSet {
    pair: Pair,
    shutdown: watch::Sender<bool>,
    connections: Connections,
    supervisor: JoinHandle<()>,
}

pub struct StreamManager {
    symbols: Arc<dyn SymbolSource>,
    adapters: AdapterLookup,
    epoch: RunEpoch,
    events: mpsc::UnboundedSender<StreamEvent>,
    active: Option<ActiveSet>,
}

impl StreamManager {
    pub fn new(symbols: Arc<dyn SymbolSource>) -> (Self, mpsc::UnboundedReceiver<StreamEvent>) {
        Self::with_adapters(symbols, adapter_for)
    }

    pub fn with_adapters(
        symbols: Arc<dyn SymbolSource>,
        adapters: AdapterLookup,
    ) -> (Self, mpsc::UnboundedReceiver<StreamEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let manager = Self {
            symbols,
            adapters,
            epoch: RunEpoch::new(),
            events,
            active: None,
        };
        (manager, rx)
    }

    pub fn supports(&self, exchange: &ExchangeId) -> bool {
        (self.adapters)(exchange).is_some()
    }

    pub fn current_pair(&self) -> Option<&Pair> {
        self.active.as_ref().map(|active| &active.pair)
    }

    /// Exchanges whose connection is still alive.
    pub fn active_exchanges(&self) -> Vec<ExchangeId> {
        let mut exchanges: Vec<ExchangeId> = self
            .active
            .as_ref()
            .map(|active| active.connections.lock().keys().cloned().collect())
            .unwrap_or_default();
        exchanges.sort();
        exchanges
    }

    /// Stops the previous set, then connects every supported exchange for
    /// `pair`. Returns the exchanges a connection was spawned for.
    pub async fn start(&mut self, pair: &Pair, exchanges: &[ExchangeId]) -> Vec<ExchangeId> {
        self.stop().await;
        let run_id = self.epoch.advance();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (conn_tx, conn_rx) = mpsc::unbounded_channel();
        let connections: Connections = Arc::default();
        let mut started = Vec::new();

        for exchange in exchanges {
            let Some(adapter) = (self.adapters)(exchange) else {
                debug!(%exchange, "[WS] no streaming adapter");
                continue;
            };
            let symbol = match self.symbols.venue_symbol(exchange, pair).await {
                Ok(symbol) => symbol,
                Err(err) => {
                    warn!(%exchange, %pair, error = %err, "[WS] disabled");
                    let _ = self.events.send(StreamEvent::Failed {
                        exchange: exchange.clone(),
                        message: err.to_string(),
                    });
                    continue;
                }
            };
            let connection = Connection {
                run_id,
                exchange: exchange.clone(),
                pair: pair.clone(),
                symbol,
                adapter,
                events: conn_tx.clone(),
            };
            let handle = tokio::spawn(connection.run(shutdown_rx.clone()));
            connections.lock().insert(exchange.clone(), handle);
            started.push(exchange.clone());
        }
        drop(conn_tx);

        let supervisor = tokio::spawn(supervise(
            conn_rx,
            self.epoch.clone(),
            connections.clone(),
            self.events.clone(),
        ));
        info!(%pair, run_id, connections = started.len(), "[WS] streaming started");
        self.active = Some(ActiveSet {
            pair: pair.clone(),
            shutdown,
            connections,
            supervisor,
        });
        started
    }

    /// Signals every connection to close and waits at most a short grace
    /// period; stragglers are aborted. Events still in flight are discarded.
    pub async fn stop(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        self.epoch.advance();
        let _ = active.shutdown.send(true);
        let handles: Vec<JoinHandle<()>> = active
            .connections
            .lock()
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        if tokio::time::timeout(STOP_GRACE, futures::future::join_all(handles))
            .await
            .is_err()
        {
            debug!(pair = %active.pair, "[WS] grace period elapsed, aborting connections");
            for abort in aborts {
                abort.abort();
            }
        }
        active.supervisor.abort();
        info!(pair = %active.pair, "[WS] streaming stopped");
    }
}

impl Drop for StreamManager {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            let _ = active.shutdown.send(true);
            active.supervisor.abort();
        }
    }
}

/// Forwards current-run events and retires failed connections.
async fn supervise(
    mut conn_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    epoch: RunEpoch,
    connections: Connections,
    events: mpsc::UnboundedSender<StreamEvent>,
) {
    while let Some(event) = conn_rx.recv().await {
        if !epoch.is_current(event.run_id) {
            continue;
        }
        let forwarded = match event.kind {
            ConnectionEventKind::Quote(snapshot) => StreamEvent::Quote(snapshot),
            ConnectionEventKind::Failed(message) => {
                // the task has already returned; only this exchange is removed
                connections.lock().remove(&event.exchange);
                StreamEvent::Failed {
                    exchange: event.exchange,
                    message,
                }
            }
        };
        if events.send(forwarded).is_err() {
            break;
        }
    }
}
