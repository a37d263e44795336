//! Venue adapter interface and the static exchange → adapter table.

use super::venues::{Binance, Bitfinex, Bitget, Bybit, Coinbase, Gate, Kraken, Okx};
use crate::models::ExchangeId;
use serde::Deserialize;

/// Prices carried by one pushed ticker message.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WsQuote {
    pub bid: f64,
    pub ask: f64,
    pub last: f64,
    /// Venue event time in epoch milliseconds, when the message has one.
    pub event_ms: Option<i64>,
}

/// Result of normalizing one inbound text message.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Quote(WsQuote),
    /// Venue-level error; the connection is considered failed.
    Error(String),
    /// Acks, heartbeats, anything without prices.
    Ignore,
}

/// One venue's streaming wire protocol. Adapters are stateless; everything
/// per-connection lives in the connection task.
pub trait StreamAdapter: Send + Sync {
    /// Exchange id as used throughout the crate, e.g. `Gate.io`.
    fn exchange(&self) -> &'static str;

    /// Venue encoding of a canonical `BASE/QUOTE` symbol.
    fn stream_symbol(&self, symbol: &str) -> String;

    fn endpoint(&self, stream_symbol: &str) -> String;

    /// Text frames sent right after connecting.
    fn subscribe_frames(&self, stream_symbol: &str) -> Vec<String>;

    fn normalize(&self, raw: &str) -> Frame;
}

static ADAPTERS: &[&dyn StreamAdapter] = &[
    &Binance, &Bybit, &Okx, &Coinbase, &Kraken, &Gate, &Bitget, &Bitfinex,
];

pub fn adapter_for(exchange: &ExchangeId) -> Option<&'static dyn StreamAdapter> {
    ADAPTERS
        .iter()
        .copied()
        .find(|adapter| adapter.exchange() == exchange.as_str())
}

pub fn supports_streaming(exchange: &ExchangeId) -> bool {
    adapter_for(exchange).is_some()
}

/// Every exchange with a streaming adapter, in table order.
pub fn streaming_exchanges() -> Vec<ExchangeId> {
    ADAPTERS
        .iter()
        .map(|adapter| ExchangeId::from(adapter.exchange()))
        .collect()
}

/// Venues send prices either as JSON strings or numbers.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum Num {
    Text(String),
    Float(f64),
}

impl Num {
    pub(crate) fn value(&self) -> Option<f64> {
        match self {
            Num::Text(text) => text.trim().parse().ok(),
            Num::Float(value) => Some(*value),
        }
    }
}

/// Builds a quote frame when all three prices are present and numeric.
pub(crate) fn quote_frame(
    bid: Option<&Num>,
    ask: Option<&Num>,
    last: Option<&Num>,
    event_ms: Option<i64>,
) -> Frame {
    match (
        bid.and_then(Num::value),
        ask.and_then(Num::value),
        last.and_then(Num::value),
    ) {
        (Some(bid), Some(ask), Some(last)) => Frame::Quote(WsQuote {
            bid,
            ask,
            last,
            event_ms,
        }),
        _ => Frame::Ignore,
    }
}

/// Splits `BASE/QUOTE`; symbols without a separator split after three chars.
pub(crate) fn base_quote(symbol: &str) -> (String, String) {
    let (base, quote) = match symbol.split_once('/') {
        Some(parts) => parts,
        None if symbol.len() > 3 && symbol.is_char_boundary(3) => symbol.split_at(3),
        None => (symbol, ""),
    };
    (base.to_uppercase(), quote.to_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_covers_streaming_venues() {
        let names: Vec<String> = streaming_exchanges().iter().map(|e| e.to_string()).collect();
        assert_eq!(
            names,
            vec!["Binance", "Bybit", "OKX", "Coinbase", "Kraken", "Gate.io", "Bitget", "Bitfinex"]
        );
        assert!(supports_streaming(&ExchangeId::from("Kraken")));
        assert!(!supports_streaming(&ExchangeId::from("HTX")));
    }

    #[test]
    fn numbers_parse_from_text_or_float() {
        let parsed: Vec<Num> = serde_json::from_str(r#"["101.5", 99.25, "bad"]"#).unwrap();
        let values: Vec<Option<f64>> = parsed.iter().map(Num::value).collect();
        assert_eq!(values, vec![Some(101.5), Some(99.25), None]);
    }

    #[test]
    fn base_quote_handles_both_shapes() {
        assert_eq!(base_quote("btc/usdt"), ("BTC".into(), "USDT".into()));
        assert_eq!(base_quote("ETHUSD"), ("ETH".into(), "USD".into()));
    }
}
