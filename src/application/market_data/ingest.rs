//! WebSocket candle ingest.
//!
//! One connection carries every `(symbol, timeframe)` subscription. The
//! socket is kept alive with an 18-second ping; three missed pongs force a
//! reconnect with exponential backoff capped at one minute, after which
//! subscriptions are re-sent in their original order. Closed candles are
//! normalized and ordered before publication: a duplicate timestamp
//! replaces the buffered copy, an out-of-order bar is dropped with a
//! warning, and exactly one event is published per closed candle.

use super::CandleEvent;
use crate::application::rate_limit::RateLimitBudget;
use crate::domain::types::{Candle, Timeframe};
use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, broadcast, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub ws_url: String,
    /// Closed candles retained per subscription.
    pub ring_capacity: usize,
    pub heartbeat_interval: Duration,
    pub max_missed_pongs: u32,
    pub max_backoff: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            ws_url: "wss://localhost/stream".to_string(),
            ring_capacity: 500,
            heartbeat_interval: Duration::from_secs(18),
            max_missed_pongs: 3,
            max_backoff: Duration::from_secs(60),
        }
    }
}

/// What happened to an incoming candle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// New closed candle appended; publish it.
    Published,
    /// Same timestamp as the buffered head; replaced in place, publish the
    /// corrected copy.
    Replaced,
    /// Older than the buffered head; dropped.
    DroppedOutOfOrder,
}

/// Per-subscription ring buffers with ordering enforcement. Separated from
/// the socket loop so the sequencing rules are testable without a network.
pub struct SubscriptionBook {
    ring_capacity: usize,
    rings: HashMap<(String, Timeframe), VecDeque<Candle>>,
}

impl SubscriptionBook {
    pub fn new(ring_capacity: usize) -> Self {
        Self {
            ring_capacity,
            rings: HashMap::new(),
        }
    }

    /// Applies one normalized candle, enforcing timestamp order.
    pub fn apply(&mut self, symbol: &str, timeframe: Timeframe, candle: Candle) -> ApplyOutcome {
        let key = (symbol.to_string(), timeframe);
        let ring = self.rings.entry(key).or_default();

        if let Some(last) = ring.back() {
            if candle.timestamp < last.timestamp {
                warn!(
                    "Dropping out-of-order candle for {} {} ({} < {})",
                    symbol, timeframe, candle.timestamp, last.timestamp
                );
                return ApplyOutcome::DroppedOutOfOrder;
            }
            if candle.timestamp == last.timestamp {
                *ring.back_mut().expect("ring is non-empty") = candle;
                return ApplyOutcome::Replaced;
            }
            let expected = last.timestamp + timeframe.to_millis();
            if candle.timestamp > expected {
                warn!(
                    "Gap in {} {} candles: expected {}, got {}",
                    symbol, timeframe, expected, candle.timestamp
                );
            }
        }

        ring.push_back(candle);
        if ring.len() > self.ring_capacity {
            ring.pop_front();
        }
        ApplyOutcome::Published
    }

    /// Latest closed candles, oldest first.
    pub fn recent(&self, symbol: &str, timeframe: Timeframe) -> Vec<Candle> {
        self.rings
            .get(&(symbol.to_string(), timeframe))
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// Raw wire shape of a candle push.
#[derive(Debug, Deserialize)]
struct CandleMessage {
    topic: String,
    #[serde(rename = "type")]
    kind: String,
    data: CandleData,
}

#[derive(Debug, Deserialize)]
struct CandleData {
    symbol: String,
    timeframe: String,
    /// Millisecond timestamp of the bar open.
    time: i64,
    open: String,
    high: String,
    low: String,
    close: String,
    volume: String,
}

fn parse_timeframe(raw: &str) -> Option<Timeframe> {
    match raw {
        "1min" => Some(Timeframe::OneMin),
        "5min" => Some(Timeframe::FiveMin),
        "15min" => Some(Timeframe::FifteenMin),
        "1hour" => Some(Timeframe::OneHour),
        "4hour" => Some(Timeframe::FourHour),
        "1day" => Some(Timeframe::OneDay),
        _ => None,
    }
}

/// Normalizes wire fields into a candle: decimal OHLCV, UTC millisecond
/// timestamp, volume clamped non-negative.
fn normalize(data: &CandleData) -> Result<Candle> {
    let field = |name: &str, raw: &str| -> Result<Decimal> {
        Decimal::from_str(raw).with_context(|| format!("bad {} '{}'", name, raw))
    };
    let volume = field("volume", &data.volume)?.max(Decimal::ZERO);
    Ok(Candle {
        timestamp: data.time,
        open: field("open", &data.open)?,
        high: field("high", &data.high)?,
        low: field("low", &data.low)?,
        close: field("close", &data.close)?,
        volume,
    })
}

pub struct MarketDataIngest {
    config: IngestConfig,
    /// Subscription order is preserved across reconnects.
    subscriptions: Vec<(String, Timeframe)>,
    book: Arc<Mutex<SubscriptionBook>>,
    event_tx: broadcast::Sender<CandleEvent>,
    budget: Arc<RateLimitBudget>,
}

impl MarketDataIngest {
    pub fn new(
        config: IngestConfig,
        subscriptions: Vec<(String, Timeframe)>,
        budget: Arc<RateLimitBudget>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(1024);
        let book = Arc::new(Mutex::new(SubscriptionBook::new(config.ring_capacity)));
        Self {
            config,
            subscriptions,
            book,
            event_tx,
            budget,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CandleEvent> {
        self.event_tx.subscribe()
    }

    pub async fn recent_candles(&self, symbol: &str, timeframe: Timeframe) -> Vec<Candle> {
        self.book.lock().await.recent(symbol, timeframe)
    }

    /// Connects and streams until shutdown, reconnecting on failure.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = Duration::from_secs(1);
        loop {
            if *shutdown.borrow() {
                return;
            }
            let session = tokio::select! {
                result = self.connect_and_stream() => result,
                _ = shutdown.changed() => {
                    info!("Market-data ingest stopping");
                    return;
                }
            };
            match session {
                Ok(()) => {
                    info!("Market-data socket closed; reconnecting");
                    backoff = Duration::from_secs(1);
                }
                Err(e) => {
                    error!(
                        "Market-data socket error: {:#}. Reconnecting in {:?}",
                        e, backoff
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = shutdown.changed() => return,
                    }
                    backoff = (backoff * 2).min(self.config.max_backoff);
                }
            }
        }
    }

    async fn connect_and_stream(&self) -> Result<()> {
        info!("Connecting market-data socket: {}", self.config.ws_url);
        let (ws_stream, _) = connect_async(&self.config.ws_url)
            .await
            .context("Failed to connect market-data socket")?;
        let (mut write, mut read) = ws_stream.split();

        // Re-send subscriptions in their original order.
        for (symbol, timeframe) in &self.subscriptions {
            let subscribe = serde_json::json!({
                "type": "subscribe",
                "topic": format!("candles:{}_{}", symbol, timeframe.to_wire_string()),
            });
            write
                .send(Message::Text(subscribe.to_string().into()))
                .await
                .context("Failed to send subscription")?;
        }
        info!("Subscribed {} candle channels", self.subscriptions.len());

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        heartbeat.tick().await; // immediate first tick
        let mut missed_pongs = 0u32;
        let mut last_message_at: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    if missed_pongs >= self.config.max_missed_pongs {
                        anyhow::bail!("{} heartbeats unanswered", missed_pongs);
                    }
                    missed_pongs += 1;
                    write
                        .send(Message::Ping(Vec::new().into()))
                        .await
                        .context("Failed to send ping")?;
                }
                frame = read.next() => {
                    let Some(frame) = frame else {
                        return Ok(());
                    };
                    match frame.context("Market-data read failed")? {
                        Message::Text(text) => {
                            let now = Instant::now();
                            if let Some(previous) = last_message_at {
                                self.budget.record_message_jitter(now.duration_since(previous));
                            }
                            last_message_at = Some(now);
                            let handled_in = Instant::now();
                            self.handle_frame(&text).await;
                            self.budget.record_loop_lag(handled_in.elapsed());
                        }
                        Message::Pong(_) => {
                            missed_pongs = 0;
                        }
                        Message::Ping(payload) => {
                            write
                                .send(Message::Pong(payload))
                                .await
                                .context("Failed to answer ping")?;
                        }
                        Message::Close(frame) => {
                            info!("Market-data socket closed by server: {:?}", frame);
                            return Ok(());
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    async fn handle_frame(&self, text: &str) {
        let message: CandleMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                // Subscription acks and heartbeats share the channel.
                debug!("Ignoring non-candle frame: {}", e);
                return;
            }
        };
        // Only fully closed bars feed the indicator layer.
        if message.kind != "close" {
            return;
        }
        let Some(timeframe) = parse_timeframe(&message.data.timeframe) else {
            warn!("Unknown timeframe in topic {}", message.topic);
            return;
        };
        let candle = match normalize(&message.data) {
            Ok(candle) => candle,
            Err(e) => {
                warn!("Malformed candle on {}: {:#}", message.topic, e);
                return;
            }
        };

        let symbol = message.data.symbol.clone();
        let outcome = self
            .book
            .lock()
            .await
            .apply(&symbol, timeframe, candle.clone());
        match outcome {
            ApplyOutcome::Published | ApplyOutcome::Replaced => {
                let _ = self.event_tx.send(CandleEvent {
                    symbol,
                    timeframe,
                    candle,
                });
            }
            ApplyOutcome::DroppedOutOfOrder => {}
        }
    }
}
