//! Wire protocols of the streaming venues.

use super::adapter::{Frame, Num, StreamAdapter, base_quote, quote_frame};
use serde::Deserialize;
use serde_json::{Value, json};

fn parse<'a, T: Deserialize<'a>>(raw: &'a str) -> Option<T> {
    serde_json::from_str(raw).ok()
}

pub struct Binance;

#[derive(Deserialize)]
struct BinanceTicker {
    #[serde(rename = "E")]
    event_time: Option<i64>,
    b: Option<Num>,
    a: Option<Num>,
    c: Option<Num>,
}

impl StreamAdapter for Binance {
    fn exchange(&self) -> &'static str {
        "Binance"
    }

    fn stream_symbol(&self, symbol: &str) -> String {
        symbol.replace('/', "").to_lowercase()
    }

    fn endpoint(&self, stream_symbol: &str) -> String {
        format!("wss://stream.binance.com:9443/ws/{stream_symbol}@ticker")
    }

    fn subscribe_frames(&self, _stream_symbol: &str) -> Vec<String> {
        Vec::new()
    }

    fn normalize(&self, raw: &str) -> Frame {
        match parse::<BinanceTicker>(raw) {
            Some(t) => quote_frame(t.b.as_ref(), t.a.as_ref(), t.c.as_ref(), t.event_time),
            None => Frame::Ignore,
        }
    }
}

pub struct Bybit;

#[derive(Deserialize)]
struct BybitMessage {
    success: Option<bool>,
    ret_msg: Option<String>,
    ts: Option<i64>,
    data: Option<BybitTicker>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BybitTicker {
    bid1_price: Option<Num>,
    ask1_price: Option<Num>,
    last_price: Option<Num>,
}

impl StreamAdapter for Bybit {
    fn exchange(&self) -> &'static str {
        "Bybit"
    }

    fn stream_symbol(&self, symbol: &str) -> String {
        symbol.replace('/', "").to_uppercase()
    }

    fn endpoint(&self, _stream_symbol: &str) -> String {
        "wss://stream.bybit.com/v5/public/spot".to_string()
    }

    fn subscribe_frames(&self, stream_symbol: &str) -> Vec<String> {
        vec![json!({"op": "subscribe", "args": [format!("tickers.{stream_symbol}")]}).to_string()]
    }

    fn normalize(&self, raw: &str) -> Frame {
        let Some(msg) = parse::<BybitMessage>(raw) else {
            return Frame::Ignore;
        };
        if msg.success == Some(false) {
            return Frame::Error(msg.ret_msg.unwrap_or_else(|| "subscription rejected".into()));
        }
        match msg.data {
            Some(d) => quote_frame(
                d.bid1_price.as_ref(),
                d.ask1_price.as_ref(),
                d.last_price.as_ref(),
                msg.ts,
            ),
            None => Frame::Ignore,
        }
    }
}

pub struct Okx;

#[derive(Deserialize)]
struct OkxMessage {
    event: Option<String>,
    msg: Option<String>,
    #[serde(default)]
    data: Vec<OkxTicker>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OkxTicker {
    bid_px: Option<Num>,
    ask_px: Option<Num>,
    last: Option<Num>,
    ts: Option<Num>,
}

impl StreamAdapter for Okx {
    fn exchange(&self) -> &'static str {
        "OKX"
    }

    fn stream_symbol(&self, symbol: &str) -> String {
        symbol.replace('/', "-").to_uppercase()
    }

    fn endpoint(&self, _stream_symbol: &str) -> String {
        "wss://ws.okx.com:8443/ws/v5/public".to_string()
    }

    fn subscribe_frames(&self, stream_symbol: &str) -> Vec<String> {
        vec![
            json!({"op": "subscribe", "args": [{"channel": "tickers", "instId": stream_symbol}]})
                .to_string(),
        ]
    }

    fn normalize(&self, raw: &str) -> Frame {
        let Some(msg) = parse::<OkxMessage>(raw) else {
            return Frame::Ignore;
        };
        if msg.event.as_deref() == Some("error") {
            return Frame::Error(msg.msg.unwrap_or_else(|| "OKX WS error".into()));
        }
        match msg.data.first() {
            Some(t) => quote_frame(
                t.bid_px.as_ref(),
                t.ask_px.as_ref(),
                t.last.as_ref(),
                t.ts.as_ref().and_then(Num::value).map(|ms| ms as i64),
            ),
            None => Frame::Ignore,
        }
    }
}

pub struct Coinbase;

#[derive(Deserialize)]
struct CoinbaseMessage {
    #[serde(rename = "type")]
    kind: String,
    message: Option<String>,
    reason: Option<String>,
    best_bid: Option<Num>,
    best_ask: Option<Num>,
    price: Option<Num>,
    time: Option<String>,
}

impl StreamAdapter for Coinbase {
    fn exchange(&self) -> &'static str {
        "Coinbase"
    }

    fn stream_symbol(&self, symbol: &str) -> String {
        symbol.replace('/', "-").to_uppercase()
    }

    fn endpoint(&self, _stream_symbol: &str) -> String {
        "wss://ws-feed.exchange.coinbase.com".to_string()
    }

    fn subscribe_frames(&self, stream_symbol: &str) -> Vec<String> {
        vec![
            json!({
                "type": "subscribe",
                "channels": [{"name": "ticker", "product_ids": [stream_symbol]}]
            })
            .to_string(),
        ]
    }

    fn normalize(&self, raw: &str) -> Frame {
        let Some(msg) = parse::<CoinbaseMessage>(raw) else {
            return Frame::Ignore;
        };
        match msg.kind.as_str() {
            "error" => Frame::Error(match (msg.message, msg.reason) {
                (Some(message), Some(reason)) => format!("{message}: {reason}"),
                (Some(message), None) => message,
                (None, reason) => reason.unwrap_or_else(|| "Coinbase WS error".into()),
            }),
            "ticker" => {
                let event_ms = msg
                    .time
                    .as_deref()
                    .and_then(|t| chrono::DateTime::parse_from_rfc3339(t).ok())
                    .map(|t| t.timestamp_millis());
                quote_frame(
                    msg.best_bid.as_ref(),
                    msg.best_ask.as_ref(),
                    msg.price.as_ref(),
                    event_ms,
                )
            }
            _ => Frame::Ignore,
        }
    }
}

pub struct Kraken;

impl StreamAdapter for Kraken {
    fn exchange(&self) -> &'static str {
        "Kraken"
    }

    fn stream_symbol(&self, symbol: &str) -> String {
        let (base, quote) = base_quote(symbol);
        let base = if base == "BTC" { "XBT".to_string() } else { base };
        format!("{base}/{quote}")
    }

    fn endpoint(&self, _stream_symbol: &str) -> String {
        "wss://ws.kraken.com".to_string()
    }

    fn subscribe_frames(&self, stream_symbol: &str) -> Vec<String> {
        vec![
            json!({
                "event": "subscribe",
                "pair": [stream_symbol],
                "subscription": {"name": "ticker"}
            })
            .to_string(),
        ]
    }

    fn normalize(&self, raw: &str) -> Frame {
        let Some(payload) = parse::<Value>(raw) else {
            return Frame::Ignore;
        };
        if let Some(event) = payload.as_object() {
            let failed = event.get("event").and_then(Value::as_str) == Some("error")
                || event.get("status").and_then(Value::as_str) == Some("error");
            if failed {
                let message = event
                    .get("errorMessage")
                    .and_then(Value::as_str)
                    .unwrap_or("Kraken WS error");
                return Frame::Error(message.to_string());
            }
            return Frame::Ignore;
        }
        let Some(data) = payload.get(1).and_then(Value::as_object) else {
            return Frame::Ignore;
        };
        let level = |key: &str| -> Option<Num> {
            serde_json::from_value(data.get(key)?.get(0)?.clone()).ok()
        };
        quote_frame(level("b").as_ref(), level("a").as_ref(), level("c").as_ref(), None)
    }
}

pub struct Gate;

#[derive(Deserialize)]
struct GateMessage {
    event: Option<String>,
    channel: Option<String>,
    time: Option<i64>,
    error: Option<GateError>,
    result: Option<GateTicker>,
}

#[derive(Deserialize)]
struct GateError {
    message: Option<String>,
}

#[derive(Deserialize)]
struct GateTicker {
    highest_bid: Option<Num>,
    lowest_ask: Option<Num>,
    last: Option<Num>,
}

impl StreamAdapter for Gate {
    fn exchange(&self) -> &'static str {
        "Gate.io"
    }

    fn stream_symbol(&self, symbol: &str) -> String {
        symbol.replace('/', "_").to_uppercase()
    }

    fn endpoint(&self, _stream_symbol: &str) -> String {
        "wss://api.gateio.ws/ws/v4/".to_string()
    }

    fn subscribe_frames(&self, stream_symbol: &str) -> Vec<String> {
        vec![
            json!({
                "time": chrono::Utc::now().timestamp(),
                "channel": "spot.tickers",
                "event": "subscribe",
                "payload": [stream_symbol]
            })
            .to_string(),
        ]
    }

    fn normalize(&self, raw: &str) -> Frame {
        let Some(msg) = parse::<GateMessage>(raw) else {
            return Frame::Ignore;
        };
        if let Some(error) = msg.error {
            return Frame::Error(error.message.unwrap_or_else(|| "Gate.io WS error".into()));
        }
        if msg.event.as_deref() != Some("update") || msg.channel.as_deref() != Some("spot.tickers") {
            return Frame::Ignore;
        }
        // seconds on most frames, milliseconds on some
        let event_ms = msg
            .time
            .map(|t| if t < 1_000_000_000_000 { t * 1000 } else { t });
        match msg.result {
            Some(t) => quote_frame(
                t.highest_bid.as_ref(),
                t.lowest_ask.as_ref(),
                t.last.as_ref(),
                event_ms,
            ),
            None => Frame::Ignore,
        }
    }
}

pub struct Bitget;

#[derive(Deserialize)]
struct BitgetMessage {
    event: Option<String>,
    message: Option<String>,
    msg: Option<String>,
    #[serde(default)]
    data: Vec<BitgetTicker>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BitgetTicker {
    #[serde(alias = "bid")]
    bid_pr: Option<Num>,
    #[serde(alias = "ask")]
    ask_pr: Option<Num>,
    #[serde(alias = "last")]
    last_pr: Option<Num>,
    ts: Option<Num>,
}

impl StreamAdapter for Bitget {
    fn exchange(&self) -> &'static str {
        "Bitget"
    }

    fn stream_symbol(&self, symbol: &str) -> String {
        symbol.replace('/', "").to_uppercase()
    }

    fn endpoint(&self, _stream_symbol: &str) -> String {
        "wss://ws.bitget.com/spot/v1/stream".to_string()
    }

    fn subscribe_frames(&self, stream_symbol: &str) -> Vec<String> {
        vec![
            json!({
                "op": "subscribe",
                "args": [{"instType": "SPOT", "channel": "ticker", "instId": stream_symbol}]
            })
            .to_string(),
        ]
    }

    fn normalize(&self, raw: &str) -> Frame {
        let Some(msg) = parse::<BitgetMessage>(raw) else {
            return Frame::Ignore;
        };
        if msg.event.as_deref() == Some("error") {
            let message = msg.message.or(msg.msg);
            return Frame::Error(message.unwrap_or_else(|| "Bitget WS error".into()));
        }
        match msg.data.first() {
            Some(t) => quote_frame(
                t.bid_pr.as_ref(),
                t.ask_pr.as_ref(),
                t.last_pr.as_ref(),
                t.ts.as_ref().and_then(Num::value).map(|ms| ms as i64),
            ),
            None => Frame::Ignore,
        }
    }
}

pub struct Bitfinex;

impl StreamAdapter for Bitfinex {
    fn exchange(&self) -> &'static str {
        "Bitfinex"
    }

    fn stream_symbol(&self, symbol: &str) -> String {
        if symbol.starts_with('t') && !symbol.contains('/') {
            return symbol.to_string();
        }
        let (base, quote) = base_quote(symbol);
        let quote = if quote == "USDT" { "UST".to_string() } else { quote };
        format!("t{base}{quote}")
    }

    fn endpoint(&self, _stream_symbol: &str) -> String {
        "wss://api-pub.bitfinex.com/ws/2".to_string()
    }

    fn subscribe_frames(&self, stream_symbol: &str) -> Vec<String> {
        vec![json!({"event": "subscribe", "channel": "ticker", "symbol": stream_symbol}).to_string()]
    }

    fn normalize(&self, raw: &str) -> Frame {
        let Some(payload) = parse::<Value>(raw) else {
            return Frame::Ignore;
        };
        if let Some(event) = payload.as_object() {
            if event.get("event").and_then(Value::as_str) == Some("error") {
                let message = event
                    .get("msg")
                    .and_then(Value::as_str)
                    .unwrap_or("Bitfinex WS error");
                return Frame::Error(message.to_string());
            }
            return Frame::Ignore;
        }
        // [chanId, [BID, BID_SIZE, ASK, ASK_SIZE, CHANGE, CHANGE_REL, LAST, ...]]; heartbeats carry "hb"
        let Some(fields) = payload.get(1).and_then(Value::as_array) else {
            return Frame::Ignore;
        };
        if fields.len() < 7 {
            return Frame::Ignore;
        }
        let at = |i: usize| fields[i].as_f64().map(Num::Float);
        quote_frame(at(0).as_ref(), at(2).as_ref(), at(6).as_ref(), None)
    }
}
