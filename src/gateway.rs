//! HTTP side of the exchange connectivity gateway.
//!
//! The core never speaks a venue's REST protocol itself. An implementation of
//! [`ExchangeGateway`] owns transport, authentication, symbol encoding and the
//! fixed per-call timeout; the core only sees canonical pairs and [`Ticker`]s.

use crate::errors::GatewayError;
use crate::models::{ExchangeId, MarketDescriptor, Ticker};
use async_trait::async_trait;
use std::collections::HashMap;

pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    async fn load_markets(&self, exchange: &ExchangeId) -> GatewayResult<Vec<MarketDescriptor>>;

    async fn fetch_ticker(&self, exchange: &ExchangeId, symbol: &str) -> GatewayResult<Ticker>;

    /// Only called when [`ExchangeGateway::supports_batch`] returns true.
    async fn fetch_tickers(
        &self,
        exchange: &ExchangeId,
        symbols: &[String],
    ) -> GatewayResult<HashMap<String, Ticker>>;

    fn supports_batch(&self, exchange: &ExchangeId) -> bool;
}

#[cfg(test)]
pub(crate) mod mock {
    //! In-memory gateway used by unit tests across the crate.

    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    pub struct MockGateway {
        markets: Mutex<HashMap<ExchangeId, GatewayResult<Vec<MarketDescriptor>>>>,
        tickers: Mutex<HashMap<(ExchangeId, String), GatewayResult<Ticker>>>,
        batch: Mutex<Vec<ExchangeId>>,
        delay: Mutex<Option<Duration>>,
        pub market_calls: AtomicUsize,
        pub ticker_calls: AtomicUsize,
        pub batch_calls: AtomicUsize,
        fetched: Mutex<Vec<(ExchangeId, String)>>,
    }

    impl MockGateway {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_markets(self, exchange: &str, symbols: &[&str]) -> Self {
            let markets = symbols.iter().map(|s| MarketDescriptor::spot(s)).collect();
            self.markets.lock().insert(exchange.into(), Ok(markets));
            self
        }

        pub fn with_raw_markets(self, exchange: &str, markets: Vec<MarketDescriptor>) -> Self {
            self.markets.lock().insert(exchange.into(), Ok(markets));
            self
        }

        pub fn with_market_error(self, exchange: &str, err: GatewayError) -> Self {
            self.markets.lock().insert(exchange.into(), Err(err));
            self
        }

        pub fn with_ticker(self, exchange: &str, symbol: &str, bid: f64, ask: f64) -> Self {
            self.set_ticker(exchange, symbol, Ok(Ticker::new(bid, ask, (bid + ask) / 2.0)));
            self
        }

        pub fn with_ticker_error(self, exchange: &str, symbol: &str, err: GatewayError) -> Self {
            self.set_ticker(exchange, symbol, Err(err));
            self
        }

        pub fn with_batch(self, exchange: &str) -> Self {
            self.batch.lock().push(exchange.into());
            self
        }

        pub fn with_delay(self, delay: Duration) -> Self {
            *self.delay.lock() = Some(delay);
            self
        }

        pub fn set_ticker(&self, exchange: &str, symbol: &str, ticker: GatewayResult<Ticker>) {
            self.tickers
                .lock()
                .insert((exchange.into(), symbol.to_string()), ticker);
        }

        pub fn fetched(&self) -> Vec<(ExchangeId, String)> {
            self.fetched.lock().clone()
        }

        fn lookup(&self, exchange: &ExchangeId, symbol: &str) -> GatewayResult<Ticker> {
            self.fetched.lock().push((exchange.clone(), symbol.to_string()));
            self.tickers
                .lock()
                .get(&(exchange.clone(), symbol.to_string()))
                .cloned()
                .unwrap_or_else(|| Err(GatewayError::NoSymbol(symbol.to_string())))
        }

        async fn pause(&self) {
            let delay = *self.delay.lock();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
        }
    }

    #[async_trait]
    impl ExchangeGateway for MockGateway {
        async fn load_markets(
            &self,
            exchange: &ExchangeId,
        ) -> GatewayResult<Vec<MarketDescriptor>> {
            self.market_calls.fetch_add(1, Ordering::SeqCst);
            self.pause().await;
            self.markets
                .lock()
                .get(exchange)
                .cloned()
                .unwrap_or_else(|| Err(GatewayError::UnsupportedExchange(exchange.to_string())))
        }

        async fn fetch_ticker(&self, exchange: &ExchangeId, symbol: &str) -> GatewayResult<Ticker> {
            self.ticker_calls.fetch_add(1, Ordering::SeqCst);
            self.pause().await;
            self.lookup(exchange, symbol)
        }

        async fn fetch_tickers(
            &self,
            exchange: &ExchangeId,
            symbols: &[String],
        ) -> GatewayResult<HashMap<String, Ticker>> {
            self.batch_calls.fetch_add(1, Ordering::SeqCst);
            self.pause().await;
            let mut out = HashMap::new();
            for symbol in symbols {
                if let Ok(ticker) = self.lookup(exchange, symbol) {
                    out.insert(symbol.clone(), ticker);
                }
            }
            Ok(out)
        }

        fn supports_batch(&self, exchange: &ExchangeId) -> bool {
            self.batch.lock().contains(exchange)
        }
    }
}
