//! One supervised streaming connection: connect, subscribe, normalize and
//! forward until shutdown or the first failure.

use super::adapter::{Frame, StreamAdapter};
use crate::errors::AppError;
use crate::models::{ExchangeId, Pair, QuoteSnapshot, QuoteSource};
use crate::utils::timestamp_from_millis;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;

const PING_INTERVAL: Duration = Duration::from_secs(20);
const UPDATE_LOG_INTERVAL: Duration = Duration::from_secs(30);
const CLOSE_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ConnectionEventKind {
    Quote(QuoteSnapshot),
    Failed(String),
}

/// Event from a connection, tagged with the run that started it.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ConnectionEvent {
    pub run_id: u64,
    pub exchange: ExchangeId,
    pub kind: ConnectionEventKind,
}

/// Counts pushed updates and says when the count is due for logging.
struct UpdateCounter {
    count: u64,
    last_log: Instant,
    every: Duration,
}

impl UpdateCounter {
    fn new(every: Duration, now: Instant) -> Self {
        Self {
            count: 0,
            last_log: now,
            every,
        }
    }

    fn record(&mut self, now: Instant) -> Option<u64> {
        self.count += 1;
        if now.duration_since(self.last_log) >= self.every {
            self.last_log = now;
            Some(self.count)
        } else {
            None
        }
    }
}

pub(crate) struct Connection {
    pub run_id: u64,
    pub exchange: ExchangeId,
    pub pair: Pair,
    /// Resolved venue symbol in canonical form; the adapter encodes it.
    pub symbol: String,
    pub adapter: &'static dyn StreamAdapter,
    pub events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl Connection {
    /// Runs until `shutdown` flips to true, the sender side is dropped, or the
    /// connection fails. A failure is logged and reported exactly once.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let stream_symbol = self.adapter.stream_symbol(&self.symbol);
        let url = match Url::parse(&self.adapter.endpoint(&stream_symbol)) {
            Ok(url) => url,
            Err(err) => return self.fail(err.into()),
        };

        let connected = tokio::select! {
            _ = shutdown.changed() => return,
            res = connect_async(url) => res,
        };
        let (ws, _resp) = match connected {
            Ok(pair) => pair,
            Err(err) => return self.fail(err.into()),
        };
        info!(exchange = %self.exchange, symbol = %stream_symbol, "[WS] connected");

        let (mut write, mut read) = ws.split();
        for frame in self.adapter.subscribe_frames(&stream_symbol) {
            if let Err(err) = write.send(Message::Text(frame)).await {
                return self.fail(err.into());
            }
        }

        let mut ping = tokio::time::interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut updates = UpdateCounter::new(UPDATE_LOG_INTERVAL, Instant::now());
        let mut failure = None;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if let Err(err) = write.send(Message::Ping(Vec::new())).await {
                        failure = Some(AppError::from(err));
                        break;
                    }
                }
                msg = read.next() => {
                    let text = match msg {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                            Ok(text) => text,
                            Err(_) => continue,
                        },
                        Some(Ok(Message::Close(frame))) => {
                            failure = Some(AppError::Other(match frame {
                                Some(frame) => format!("closed by venue: {}", frame.reason),
                                None => "closed by venue".to_string(),
                            }));
                            break;
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(err)) => {
                            failure = Some(err.into());
                            break;
                        }
                        None => {
                            failure = Some(AppError::Other("stream ended".to_string()));
                            break;
                        }
                    };
                    match self.handle_text(&text) {
                        Some(Ok(snapshot)) => {
                            if let Some(count) = updates.record(Instant::now()) {
                                info!(exchange = %self.exchange, count, "[WS] updates");
                            }
                            if self.emit(ConnectionEventKind::Quote(snapshot)).is_err() {
                                // manager gone
                                break;
                            }
                        }
                        Some(Err(message)) => {
                            failure = Some(AppError::Other(message));
                            break;
                        }
                        None => {}
                    }
                }
            }
        }

        match failure {
            Some(err) => self.fail(err),
            None => {
                let _ = tokio::time::timeout(CLOSE_TIMEOUT, write.send(Message::Close(None))).await;
            }
        }
        info!(exchange = %self.exchange, "[WS] disconnected");
    }

    /// `None` for frames without prices.
    fn handle_text(&self, text: &str) -> Option<Result<QuoteSnapshot, String>> {
        match self.adapter.normalize(text) {
            Frame::Quote(quote) => Some(Ok(QuoteSnapshot::ok(
                self.exchange.clone(),
                self.pair.clone(),
                quote.bid,
                quote.ask,
                quote.last,
                QuoteSource::Ws,
                timestamp_from_millis(quote.event_ms),
            ))),
            Frame::Error(message) => Some(Err(message)),
            Frame::Ignore => {
                debug!(exchange = %self.exchange, "[WS] frame ignored");
                None
            }
        }
    }

    fn emit(&self, kind: ConnectionEventKind) -> Result<(), ()> {
        self.events
            .send(ConnectionEvent {
                run_id: self.run_id,
                exchange: self.exchange.clone(),
                kind,
            })
            .map_err(|_| ())
    }

    fn fail(&self, err: AppError) {
        let message = err.to_string();
        warn!(exchange = %self.exchange, error = %message, "[WS] error");
        let _ = self.emit(ConnectionEventKind::Failed(message));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::QuoteStatus;
    use crate::stream::venues::Binance;

    fn connection(tx: mpsc::UnboundedSender<ConnectionEvent>) -> Connection {
        Connection {
            run_id: 3,
            exchange: "Binance".into(),
            pair: "BTC/USDT".into(),
            symbol: "BTC/USDT".into(),
            adapter: &Binance,
            events: tx,
        }
    }

    #[test]
    fn update_counter_logs_at_most_once_per_interval() {
        let start = Instant::now();
        let mut counter = UpdateCounter::new(Duration::from_secs(30), start);
        assert_eq!(counter.record(start + Duration::from_secs(1)), None);
        assert_eq!(counter.record(start + Duration::from_secs(31)), Some(2));
        assert_eq!(counter.record(start + Duration::from_secs(32)), None);
    }

    #[tokio::test]
    async fn text_frames_become_ws_snapshots() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = connection(tx);
        let raw = r#"{"E":1700000000000,"b":"100.0","a":"100.5","c":"100.2"}"#;
        let snapshot = conn.handle_text(raw).unwrap().unwrap();
        assert_eq!(snapshot.source, QuoteSource::Ws);
        assert_eq!(snapshot.status, QuoteStatus::Ok);
        assert_eq!(snapshot.spread_abs, 0.5);
        assert_eq!(snapshot.pair, Pair::from("BTC/USDT"));
        assert!(conn.handle_text(r#"{"result":null,"id":1}"#).is_none());
    }

    struct FixedEndpoint(&'static str);

    impl StreamAdapter for FixedEndpoint {
        fn exchange(&self) -> &'static str {
            "Nowhere"
        }
        fn stream_symbol(&self, symbol: &str) -> String {
            symbol.to_string()
        }
        fn endpoint(&self, _stream_symbol: &str) -> String {
            self.0.to_string()
        }
        fn subscribe_frames(&self, _stream_symbol: &str) -> Vec<String> {
            Vec::new()
        }
        fn normalize(&self, _raw: &str) -> Frame {
            Frame::Ignore
        }
    }

    static UNREACHABLE: FixedEndpoint = FixedEndpoint("ws://127.0.0.1:1/ws");
    static MALFORMED: FixedEndpoint = FixedEndpoint("not a url");

    async fn single_failure(adapter: &'static FixedEndpoint) -> String {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = Connection {
            adapter,
            exchange: "Nowhere".into(),
            ..connection(tx)
        };
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        conn.run(shutdown_rx).await;

        let event = rx.recv().await.unwrap();
        assert_eq!(event.run_id, 3);
        assert_eq!(event.exchange, ExchangeId::from("Nowhere"));
        assert!(rx.recv().await.is_none());
        match event.kind {
            ConnectionEventKind::Failed(message) => message,
            other => panic!("expected a failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn refused_connection_reports_one_failure() {
        let message = single_failure(&UNREACHABLE).await;
        assert!(message.starts_with("WebSocket error"), "{message}");
    }

    #[tokio::test]
    async fn malformed_endpoint_fails_before_connecting() {
        let message = single_failure(&MALFORMED).await;
        assert!(message.starts_with("URL parse error"), "{message}");
    }
}
