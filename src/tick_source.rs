// src/tick_source.rs
//! Live trade-stream subscription feeding a bounded rolling tick window.
//!
//! The websocket read loop is the only task that writes the buffer. Readers get
//! a snapshot copy, so a decision cycle never holds the lock across its work.

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::config::TickSourceConfig;
use crate::shutdown::Shutdown;
use crate::types::Tick;

#[derive(Debug, Error)]
pub enum TickParseError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("missing field '{0}'")]
    MissingField(&'static str),
    #[error("invalid price {0}")]
    InvalidPrice(f64),
    #[error("invalid quantity {0}")]
    InvalidQuantity(f64),
}

/// Parse a trade message into a tick.
///
/// Accepts the exchange trade format (`p`, `q`, `T`, string-encoded numbers) as
/// well as the plain `{price, quantity, timestamp}` shape.
pub fn parse_tick(raw: &str) -> Result<Tick, TickParseError> {
    let json: Value = serde_json::from_str(raw)?;

    let price = number_field(&json, &["p", "price"]).ok_or(TickParseError::MissingField("price"))?;
    let quantity = number_field(&json, &["q", "quantity", "qty"])
        .ok_or(TickParseError::MissingField("quantity"))?;
    let timestamp = number_field(&json, &["T", "timestamp"])
        .ok_or(TickParseError::MissingField("timestamp"))? as i64;

    if !price.is_finite() || price <= 0.0 {
        return Err(TickParseError::InvalidPrice(price));
    }
    if !quantity.is_finite() || quantity < 0.0 {
        return Err(TickParseError::InvalidQuantity(quantity));
    }

    Ok(Tick::new(price, quantity, timestamp))
}

fn number_field(json: &Value, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|k| match json.get(*k)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse::<f64>().ok(),
        _ => None,
    })
}

/// Exponential reconnect delay, reset after a successful connection
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max, current: initial }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Answer a server ping. A failed send usually means the socket is half
/// dead; the read side notices shortly after.
async fn send_pong<S>(write: &mut S, data: Vec<u8>) -> bool
where
    S: futures_util::Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    match write.send(Message::Pong(data)).await {
        Ok(()) => true,
        Err(e) => {
            debug!("[TICK] Pong send failed: {}", e);
            false
        }
    }
}

/// Shared rolling window of recent ticks
#[derive(Clone)]
pub struct TickSource {
    ticks: Arc<RwLock<VecDeque<Tick>>>,
    max_ticks: usize,
}

impl TickSource {
    pub fn new(max_ticks: usize) -> Self {
        Self {
            ticks: Arc::new(RwLock::new(VecDeque::with_capacity(max_ticks))),
            max_ticks,
        }
    }

    /// Append a tick, evicting the oldest once the window is full
    pub async fn push(&self, tick: Tick) {
        let mut ticks = self.ticks.write().await;
        if ticks.len() >= self.max_ticks {
            ticks.pop_front();
        }
        ticks.push_back(tick);
    }

    /// Snapshot copy of the window, oldest first
    pub async fn get_recent_ticks(&self) -> Vec<Tick> {
        self.ticks.read().await.iter().copied().collect()
    }

    pub async fn len(&self) -> usize {
        self.ticks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.ticks.read().await.is_empty()
    }

    /// Parse one inbound message and append it; malformed input is logged and dropped
    pub async fn ingest_message(&self, raw: &str) -> bool {
        match parse_tick(raw) {
            Ok(tick) => {
                self.push(tick).await;
                true
            }
            Err(e) => {
                warn!("[TICK] Dropping malformed message: {}", e);
                debug!("[TICK] Raw message: {}", raw);
                false
            }
        }
    }

    /// Maintain the subscription until cancelled.
    ///
    /// The buffer is left untouched across disconnects so the decision loop keeps
    /// working on the last known window.
    pub async fn run(&self, config: &TickSourceConfig, symbol: &str, shutdown: Shutdown) {
        let url = config.stream_url(symbol);
        let mut backoff = Backoff::new(
            Duration::from_millis(config.backoff_initial_ms),
            Duration::from_millis(config.backoff_max_ms),
        );

        loop {
            if shutdown.is_triggered() {
                break;
            }

            info!("[TICK] Connecting to {}", url);
            let connected = tokio::select! {
                _ = shutdown.wait() => break,
                result = connect_async(url.as_str()) => result,
            };

            match connected {
                Ok((ws, _)) => {
                    info!("[TICK] Connected to trade stream for {}", symbol.to_uppercase());
                    backoff.reset();
                    let (mut write, mut read) = ws.split();

                    loop {
                        let msg = tokio::select! {
                            _ = shutdown.wait() => break,
                            msg = read.next() => msg,
                        };

                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                self.ingest_message(&text).await;
                            }
                            Some(Ok(Message::Ping(data))) => {
                                send_pong(&mut write, data).await;
                            }
                            Some(Ok(Message::Close(frame))) => {
                                warn!("[TICK] Server closed stream: {:?}", frame);
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                error!("[TICK] WebSocket error: {}", e);
                                break;
                            }
                            None => break,
                        }
                    }
                }
                Err(e) => {
                    error!("[TICK] Connect failed: {}", e);
                }
            }

            if shutdown.is_triggered() {
                break;
            }

            let delay = backoff.next_delay();
            warn!("[TICK] Disconnected, reconnecting in {:?}", delay);
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!("[TICK] Stream task stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_exchange_trade_format() {
        let raw = r#"{"e":"trade","E":1700000000001,"s":"BTCUSDT","t":1,"p":"43250.10","q":"0.0150","T":1700000000000,"m":true}"#;
        let tick = parse_tick(raw).unwrap();
        assert!((tick.price - 43250.10).abs() < 1e-9);
        assert!((tick.quantity - 0.015).abs() < 1e-12);
        assert_eq!(tick.timestamp, 1_700_000_000_000);
    }

    #[test]
    fn test_parse_plain_format() {
        let tick = parse_tick(r#"{"price":101.5,"quantity":2,"timestamp":42}"#).unwrap();
        assert_eq!(tick, Tick::new(101.5, 2.0, 42));
    }

    #[test]
    fn test_parse_rejects_bad_messages() {
        assert!(matches!(parse_tick("not json"), Err(TickParseError::Json(_))));
        assert!(matches!(
            parse_tick(r#"{"quantity":1,"timestamp":1}"#),
            Err(TickParseError::MissingField("price"))
        ));
        assert!(matches!(
            parse_tick(r#"{"price":0,"quantity":1,"timestamp":1}"#),
            Err(TickParseError::InvalidPrice(_))
        ));
        assert!(matches!(
            parse_tick(r#"{"price":"10","quantity":"-1","timestamp":1}"#),
            Err(TickParseError::InvalidQuantity(_))
        ));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(500));
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(400));
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_window_evicts_oldest() {
        let source = TickSource::new(3);
        for i in 0..5 {
            source.push(Tick::new(100.0 + i as f64, 1.0, i)).await;
        }
        let ticks = source.get_recent_ticks().await;
        assert_eq!(ticks.len(), 3);
        assert_eq!(ticks[0].timestamp, 2);
        assert_eq!(ticks[2].timestamp, 4);
    }

    #[tokio::test]
    async fn test_snapshot_is_detached_from_buffer() {
        let source = TickSource::new(10);
        source.push(Tick::new(100.0, 1.0, 1)).await;
        let snapshot = source.get_recent_ticks().await;
        source.push(Tick::new(101.0, 1.0, 2)).await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(source.len().await, 2);
    }

    #[tokio::test]
    async fn test_malformed_message_leaves_buffer_untouched() {
        let source = TickSource::new(10);
        assert!(source.ingest_message(r#"{"p":"100","q":"1","T":1}"#).await);
        assert!(!source.ingest_message("{garbage").await);
        assert_eq!(source.len().await, 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let source = TickSource::new(10);
        let config = TickSourceConfig {
            url: "ws://127.0.0.1:9/{symbol}".to_string(),
            max_ticks: 10,
            backoff_initial_ms: 10,
            backoff_max_ms: 20,
        };
        let shutdown = Shutdown::new();
        let task = {
            let source = source.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { source.run(&config, "btcusdt", shutdown).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert!(source.is_empty().await);
    }

    #[tokio::test]
    async fn test_pong_send_failure_is_reported() {
        use tokio_tungstenite::tungstenite::Error as WsError;

        let mut closed = futures_util::sink::unfold((), |(), _msg: Message| {
            futures_util::future::ready(Err::<(), WsError>(WsError::ConnectionClosed))
        });
        assert!(!send_pong(&mut closed, vec![1, 2]).await);

        let mut sent = Vec::new();
        assert!(send_pong(&mut sent, vec![7]).await);
        assert_eq!(sent, vec![Message::Pong(vec![7])]);
    }
}
