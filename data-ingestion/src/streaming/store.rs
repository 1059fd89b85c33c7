use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use common::{Candle, DataKind, Liquidation, OrderBook, OrderBookLevel, Symbol, Ticker, Trade};
use dashmap::{DashMap, DashSet};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::normalize::{
    classify_topic, normalize_interval, normalize_klines, normalize_liquidations,
    normalize_orderbook, normalize_ticker, normalize_trades, BookUpdate,
};
use super::StreamingConfig;

const FEED_STOP_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Default)]
struct StreamingRecord {
    ticker: Option<Ticker>,
    orderbook: Option<OrderBook>,
    trades: VecDeque<Trade>,
    klines: HashMap<String, VecDeque<Candle>>,
    liquidations: VecDeque<Liquidation>,
    updated: HashMap<DataKind, Instant>,
}

struct FeedHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamStatus {
    pub connected: bool,
    pub seconds_since_last_message: Option<f64>,
    pub subscribed: usize,
    /// Age of the freshest update of each kind across all symbols.
    pub kind_ages: BTreeMap<DataKind, f64>,
}

/// In-memory real-time data per subscribed symbol.
///
/// Only the feed writes; the collector and everyone else read through the
/// getters, which hand out copies.
pub struct StreamingStore {
    config: StreamingConfig,
    records: DashMap<Symbol, StreamingRecord>,
    subscriptions: DashSet<Symbol>,
    connected: AtomicBool,
    last_message: Mutex<Option<Instant>>,
    feed: Mutex<Option<FeedHandle>>,
}

impl StreamingStore {
    pub fn new(config: StreamingConfig) -> Self {
        Self {
            config,
            records: DashMap::new(),
            subscriptions: DashSet::new(),
            connected: AtomicBool::new(false),
            last_message: Mutex::new(None),
            feed: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &StreamingConfig {
        &self.config
    }

    pub fn subscribe<I, S>(&self, symbols: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<Symbol>,
    {
        for symbol in symbols {
            self.subscriptions.insert(symbol.into());
        }
    }

    pub fn is_subscribed(&self, symbol: &str) -> bool {
        self.subscriptions.contains(symbol)
    }

    pub fn subscribed_symbols(&self) -> Vec<Symbol> {
        let mut symbols: Vec<Symbol> = self.subscriptions.iter().map(|s| s.key().clone()).collect();
        symbols.sort();
        symbols
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn mark_connected(&self, connected: bool) {
        let was = self.connected.swap(connected, Ordering::AcqRel);
        if was != connected {
            info!(connected, "stream connection state changed");
        }
    }

    /// Applies one pushed message. Returns false when the message was
    /// ignored (unsubscribed symbol, unknown topic, unusable payload).
    pub fn handle_message(&self, symbol: &str, topic: &str, payload: &Value) -> bool {
        self.apply(symbol, topic, payload, Instant::now())
    }

    fn apply(&self, symbol: &str, topic: &str, payload: &Value, now: Instant) -> bool {
        *self.last_message.lock().unwrap_or_else(PoisonError::into_inner) = Some(now);

        if !self.subscriptions.contains(symbol) {
            debug!(symbol, topic, "message for unsubscribed symbol ignored");
            return false;
        }
        let Some((kind, param)) = classify_topic(topic) else {
            debug!(topic, "unrouted topic");
            return false;
        };

        let received_at = Utc::now();
        let mut record = self.records.entry(symbol.to_string()).or_default();
        let applied = match kind {
            DataKind::Ticker => {
                match normalize_ticker(symbol, payload, record.ticker.as_ref(), received_at) {
                    Some(ticker) => {
                        record.ticker = Some(ticker);
                        true
                    }
                    None => false,
                }
            }
            DataKind::OrderBook => match normalize_orderbook(payload) {
                Some(update) => {
                    let depth = self.config.orderbook_depth;
                    apply_book(&mut record.orderbook, update, depth);
                    true
                }
                None => false,
            },
            DataKind::Trades => {
                let trades = normalize_trades(payload, received_at);
                let cap = self.config.max_trades;
                push_capped(&mut record.trades, trades, cap)
            }
            DataKind::Liquidations => {
                let liqs = normalize_liquidations(symbol, payload, received_at);
                let cap = self.config.max_liquidations;
                push_capped(&mut record.liquidations, liqs, cap)
            }
            DataKind::Kline => {
                let interval = param.as_deref().map(normalize_interval);
                let candles = normalize_klines(payload);
                match interval {
                    Some(interval) if !candles.is_empty() => {
                        let cap = self.config.max_klines;
                        let series = record.klines.entry(interval).or_default();
                        for candle in candles {
                            upsert_candle(series, candle);
                        }
                        while series.len() > cap {
                            series.pop_front();
                        }
                        true
                    }
                    _ => false,
                }
            }
        };

        if applied {
            record.updated.insert(kind, now);
        } else {
            warn!(symbol, topic, "stream payload could not be normalised");
        }
        applied
    }

    pub fn status(&self) -> StreamStatus {
        let now = Instant::now();
        let mut kind_ages: BTreeMap<DataKind, f64> = BTreeMap::new();
        for record in self.records.iter() {
            for (kind, at) in &record.updated {
                let age = now.duration_since(*at).as_secs_f64();
                kind_ages
                    .entry(*kind)
                    .and_modify(|a| *a = a.min(age))
                    .or_insert(age);
            }
        }
        let last = *self.last_message.lock().unwrap_or_else(PoisonError::into_inner);
        StreamStatus {
            connected: self.is_connected(),
            seconds_since_last_message: last.map(|t| now.duration_since(t).as_secs_f64()),
            subscribed: self.subscriptions.len(),
            kind_ages,
        }
    }

    /// Whether `kind` for `symbol` was updated within `max_age` over a live
    /// connection.
    pub fn is_fresh(&self, symbol: &str, kind: DataKind, max_age: Duration) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.records
            .get(symbol)
            .and_then(|r| r.updated.get(&kind).copied())
            .map_or(false, |at| at.elapsed() <= max_age)
    }

    pub fn ticker(&self, symbol: &str) -> Option<Ticker> {
        self.records.get(symbol)?.ticker.clone()
    }

    pub fn orderbook(&self, symbol: &str) -> Option<OrderBook> {
        self.records.get(symbol)?.orderbook.clone()
    }

    pub fn trades(&self, symbol: &str) -> Option<Vec<Trade>> {
        let record = self.records.get(symbol)?;
        (!record.trades.is_empty()).then(|| record.trades.iter().cloned().collect())
    }

    pub fn klines(&self, symbol: &str, interval: &str) -> Option<Vec<Candle>> {
        let record = self.records.get(symbol)?;
        let series = record.klines.get(interval)?;
        (!series.is_empty()).then(|| series.iter().copied().collect())
    }

    pub fn liquidations(&self, symbol: &str) -> Option<Vec<Liquidation>> {
        let record = self.records.get(symbol)?;
        (!record.liquidations.is_empty()).then(|| record.liquidations.iter().cloned().collect())
    }

    pub(crate) fn attach_feed(&self, shutdown: watch::Sender<bool>, task: JoinHandle<()>) {
        let previous = self
            .feed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(FeedHandle { shutdown, task });
        if let Some(old) = previous {
            let _ = old.shutdown.send(true);
            old.task.abort();
        }
    }

    /// Stops the feed task, waits for it, then drops all held data. A task
    /// that does not acknowledge the shutdown within the grace period is
    /// aborted.
    pub async fn close(&self) {
        let handle = self.feed.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(FeedHandle { shutdown, mut task }) = handle {
            let _ = shutdown.send(true);
            match tokio::time::timeout(FEED_STOP_GRACE, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if !e.is_cancelled() {
                        warn!(error = %e, "stream feed task ended abnormally");
                    }
                }
                Err(_) => {
                    warn!(grace = ?FEED_STOP_GRACE, "stream feed did not stop in time, aborting");
                    task.abort();
                    let _ = task.await;
                }
            }
        }
        self.mark_connected(false);
        self.records.clear();
        self.subscriptions.clear();
        *self.last_message.lock().unwrap_or_else(PoisonError::into_inner) = None;
        info!("streaming store closed");
    }
}

fn push_capped<T>(buffer: &mut VecDeque<T>, items: Vec<T>, cap: usize) -> bool {
    if items.is_empty() {
        return false;
    }
    buffer.extend(items);
    while buffer.len() > cap {
        buffer.pop_front();
    }
    true
}

/// Keeps timestamps strictly increasing: same-timestamp updates replace the
/// candle in place, older unknown timestamps are dropped.
fn upsert_candle(series: &mut VecDeque<Candle>, candle: Candle) {
    match series.back() {
        None => series.push_back(candle),
        Some(last) if candle.timestamp > last.timestamp => series.push_back(candle),
        Some(_) => {
            if let Some(existing) = series.iter_mut().rev().find(|c| c.timestamp == candle.timestamp) {
                *existing = candle;
            }
        }
    }
}

fn apply_side(levels: &mut Vec<OrderBookLevel>, updates: Vec<(f64, f64)>) {
    for (price, size) in updates {
        let pos = levels.iter().position(|l| l.price == price);
        match (pos, size > 0.0) {
            (Some(i), true) => levels[i].size = size,
            (Some(i), false) => {
                levels.remove(i);
            }
            (None, true) => levels.push(OrderBookLevel { price, size }),
            (None, false) => {}
        }
    }
}

fn apply_book(book: &mut Option<OrderBook>, update: BookUpdate, depth: usize) {
    let timestamp = update.timestamp.unwrap_or_else(Utc::now);
    if update.is_snapshot || book.is_none() {
        *book = Some(OrderBook {
            bids: Vec::new(),
            asks: Vec::new(),
            timestamp,
        });
    }
    let Some(current) = book.as_mut() else {
        return;
    };
    apply_side(&mut current.bids, update.bids);
    apply_side(&mut current.asks, update.asks);
    current.bids.sort_by(|a, b| b.price.total_cmp(&a.price));
    current.asks.sort_by(|a, b| a.price.total_cmp(&b.price));
    current.bids.truncate(depth);
    current.asks.truncate(depth);
    current.timestamp = timestamp;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> StreamingStore {
        let config = StreamingConfig {
            max_trades: 3,
            max_klines: 2,
            ..StreamingConfig::default()
        };
        let store = StreamingStore::new(config);
        store.subscribe(["BTCUSDT"]);
        store.mark_connected(true);
        store
    }

    #[tokio::test]
    async fn test_ignores_unsubscribed_symbols() {
        let store = store();
        let payload = json!({"data": {"lastPrice": "1"}});
        assert!(!store.handle_message("DOGEUSDT", "tickers.DOGEUSDT", &payload));
        assert!(store.ticker("DOGEUSDT").is_none());
        assert!(store.handle_message("BTCUSDT", "tickers.BTCUSDT", &payload));
        assert_eq!(store.ticker("BTCUSDT").and_then(|t| t.last), Some(1.0));
    }

    #[tokio::test]
    async fn test_trades_capped_to_last_n() {
        let store = store();
        for i in 0..5 {
            let payload = json!({"data": [{"T": 1708627200000i64 + i, "S": "Buy", "v": "1", "p": (100 + i).to_string()}]});
            store.handle_message("BTCUSDT", "publicTrade.BTCUSDT", &payload);
        }
        let trades = store.trades("BTCUSDT").unwrap();
        assert_eq!(trades.len(), 3);
        assert_eq!(trades[0].price, 102.0);
        assert_eq!(trades[2].price, 104.0);
    }

    #[tokio::test]
    async fn test_kline_upsert_and_cap() {
        let store = store();
        let kline = |start: i64, close: &str| {
            json!({"data": [{"start": start, "open": "1", "high": "5", "low": "1", "close": close, "volume": "1"}]})
        };
        store.handle_message("BTCUSDT", "kline.5.BTCUSDT", &kline(1_000_000, "2"));
        store.handle_message("BTCUSDT", "kline.5.BTCUSDT", &kline(1_000_000, "3"));
        store.handle_message("BTCUSDT", "kline.5.BTCUSDT", &kline(1_300_000, "4"));
        store.handle_message("BTCUSDT", "kline.5.BTCUSDT", &kline(1_600_000, "5"));

        let candles = store.klines("BTCUSDT", "5m").unwrap();
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].close, 4.0);
        assert!(candles[0].timestamp < candles[1].timestamp);
    }

    #[tokio::test]
    async fn test_orderbook_delta_applies_on_snapshot() {
        let store = store();
        let snapshot = json!({"type": "snapshot", "ts": 1708627200000i64, "data": {
            "b": [["100", "1"], ["99", "2"]], "a": [["101", "1"], ["102", "3"]]
        }});
        let delta = json!({"type": "delta", "ts": 1708627200100i64, "data": {
            "b": [["100", "0"], ["99.5", "4"]], "a": [["101", "2"]]
        }});
        store.handle_message("BTCUSDT", "orderbook.50.BTCUSDT", &snapshot);
        store.handle_message("BTCUSDT", "orderbook.50.BTCUSDT", &delta);

        let book = store.orderbook("BTCUSDT").unwrap();
        assert_eq!(book.best_bid(), Some(99.5));
        assert_eq!(book.bids.len(), 2);
        assert_eq!(book.asks[0].size, 2.0);
        assert!(!book.is_crossed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_freshness_and_status() {
        let store = store();
        store.handle_message("BTCUSDT", "tickers.BTCUSDT", &json!({"data": {"lastPrice": "1"}}));
        assert!(store.is_fresh("BTCUSDT", DataKind::Ticker, Duration::from_secs(5)));
        assert!(!store.is_fresh("BTCUSDT", DataKind::OrderBook, Duration::from_secs(5)));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(!store.is_fresh("BTCUSDT", DataKind::Ticker, Duration::from_secs(5)));

        let status = store.status();
        assert!(status.connected);
        assert_eq!(status.subscribed, 1);
        assert!(status.kind_ages[&DataKind::Ticker] >= 6.0);
        assert!(status.seconds_since_last_message.unwrap() >= 6.0);

        store.mark_connected(false);
        store.handle_message("BTCUSDT", "tickers.BTCUSDT", &json!({"data": {"lastPrice": "2"}}));
        assert!(!store.is_fresh("BTCUSDT", DataKind::Ticker, Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn test_close_clears_state_and_stops_feed() {
        let store = store();
        store.handle_message("BTCUSDT", "tickers.BTCUSDT", &json!({"data": {"lastPrice": "1"}}));

        let (tx, mut rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let _ = rx.changed().await;
        });
        store.attach_feed(tx, task);

        store.close().await;
        assert!(store.ticker("BTCUSDT").is_none());
        assert!(!store.is_connected());
        assert!(!store.is_subscribed("BTCUSDT"));
        assert!(store.status().seconds_since_last_message.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_aborts_feed_ignoring_shutdown() {
        let store = store();
        let (shutdown, _rx) = watch::channel(false);
        let task = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        store.attach_feed(shutdown, task);

        let started = Instant::now();
        store.close().await;

        assert!(started.elapsed() < Duration::from_secs(60));
        assert!(!store.is_connected());
        assert!(store.subscribed_symbols().is_empty());
    }
}
