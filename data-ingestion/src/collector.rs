//! Per-symbol snapshot collection.
//!
//! Resolution order for one symbol: pre-warmed cache (when it holds a
//! ticker), local TTL cache, then a concurrent fan-out over every field where
//! each field prefers fresh stream data and otherwise goes to the exchange
//! with retry and a deadline. A field that cannot be resolved is left as
//! `None` and named in `missing_fields`; it never fails the snapshot.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::{
    interval_seconds, Candle, DataKind, MarketSnapshot, OpenInterest, PremiumIndex,
    SnapshotSource, Symbol, TakerVolumeRatio, TimeframeSpec,
};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::cache::{PrewarmedCache, SnapshotCache, TtlCache};
use crate::connectors::ExchangeConnector;
use crate::error::{FetchError, FetchResult};
use crate::retry::{with_retry, RetryPolicy};
use crate::streaming::StreamingStore;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    /// Timeframe name (`base`, `htf`, ...) to interval.
    #[serde(default = "default_timeframes")]
    pub timeframes: BTreeMap<String, TimeframeSpec>,
    #[serde(default = "default_ohlcv_limit")]
    pub ohlcv_limit: usize,
    #[serde(default = "default_orderbook_depth")]
    pub orderbook_depth: usize,
    #[serde(default = "default_trades_limit")]
    pub trades_limit: usize,
    #[serde(default = "default_premium_timeframe")]
    pub premium_timeframe: String,
    #[serde(default = "default_premium_limit")]
    pub premium_limit: usize,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    #[serde(default = "default_max_concurrent_symbols")]
    pub max_concurrent_symbols: usize,
    #[serde(default = "default_field_timeout_secs")]
    pub field_timeout_secs: u64,
    #[serde(default = "default_symbol_timeout_secs")]
    pub symbol_timeout_secs: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Stream data older than this is ignored in favour of the network.
    #[serde(default = "default_stream_max_age_secs")]
    pub stream_max_age_secs: u64,
}

fn default_timeframes() -> BTreeMap<String, TimeframeSpec> {
    [("base", "1m"), ("ltf", "5m"), ("mtf", "30m"), ("htf", "4h")]
        .into_iter()
        .map(|(name, tf)| (name.to_string(), TimeframeSpec::from(tf)))
        .collect()
}

fn default_ohlcv_limit() -> usize {
    200
}

fn default_orderbook_depth() -> usize {
    50
}

fn default_trades_limit() -> usize {
    100
}

fn default_premium_timeframe() -> String {
    "1h".to_string()
}

fn default_premium_limit() -> usize {
    24
}

fn default_cache_ttl_secs() -> u64 {
    30
}

fn default_cache_capacity() -> usize {
    100
}

fn default_max_concurrent_symbols() -> usize {
    10
}

fn default_field_timeout_secs() -> u64 {
    8
}

fn default_symbol_timeout_secs() -> u64 {
    90
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    250
}

fn default_stream_max_age_secs() -> u64 {
    10
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            timeframes: default_timeframes(),
            ohlcv_limit: default_ohlcv_limit(),
            orderbook_depth: default_orderbook_depth(),
            trades_limit: default_trades_limit(),
            premium_timeframe: default_premium_timeframe(),
            premium_limit: default_premium_limit(),
            cache_ttl_secs: default_cache_ttl_secs(),
            cache_capacity: default_cache_capacity(),
            max_concurrent_symbols: default_max_concurrent_symbols(),
            field_timeout_secs: default_field_timeout_secs(),
            symbol_timeout_secs: default_symbol_timeout_secs(),
            retry_attempts: default_retry_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            stream_max_age_secs: default_stream_max_age_secs(),
        }
    }
}

impl CollectorConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            timeout: Duration::from_secs(self.field_timeout_secs),
        }
    }

    /// `(name, canonical interval)` for every configured timeframe.
    pub fn resolved_timeframes(&self) -> Vec<(String, String)> {
        self.timeframes
            .iter()
            .map(|(name, spec)| (name.clone(), spec.canonical()))
            .collect()
    }
}

#[derive(Debug, Default)]
struct Counters {
    total: AtomicU64,
    success: AtomicU64,
    failed: AtomicU64,
    cache_hits: AtomicU64,
    stream_hits: AtomicU64,
}

/// Point-in-time copy of the collector counters. `success`/`failed` only
/// count network collections; a collection succeeds when the ticker resolved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CollectorStats {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
    pub cache_hits: u64,
    pub stream_hits: u64,
}

pub struct DataCollector {
    connector: Arc<dyn ExchangeConnector>,
    config: CollectorConfig,
    retry: RetryPolicy,
    cache: Arc<dyn SnapshotCache>,
    prewarmed: Option<Arc<dyn PrewarmedCache>>,
    stream: Option<Arc<StreamingStore>>,
    counters: Counters,
}

impl DataCollector {
    pub fn new(connector: Arc<dyn ExchangeConnector>, config: CollectorConfig) -> Self {
        let cache: Arc<dyn SnapshotCache> = Arc::new(TtlCache::new(
            config.cache_capacity,
            Duration::from_secs(config.cache_ttl_secs),
        ));
        Self {
            connector,
            retry: config.retry_policy(),
            config,
            cache,
            prewarmed: None,
            stream: None,
            counters: Counters::default(),
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn SnapshotCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_prewarmed(mut self, prewarmed: Arc<dyn PrewarmedCache>) -> Self {
        self.prewarmed = Some(prewarmed);
        self
    }

    pub fn with_stream(mut self, stream: Arc<StreamingStore>) -> Self {
        self.stream = Some(stream);
        self
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    pub fn exchange_id(&self) -> &str {
        self.connector.exchange_id()
    }

    pub fn stream(&self) -> Option<&Arc<StreamingStore>> {
        self.stream.as_ref()
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    pub fn stats(&self) -> CollectorStats {
        CollectorStats {
            total: self.counters.total.load(Ordering::Relaxed),
            success: self.counters.success.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            stream_hits: self.counters.stream_hits.load(Ordering::Relaxed),
        }
    }

    /// Best-effort snapshot for `symbol`. Never fails.
    pub async fn fetch(&self, symbol: &str) -> MarketSnapshot {
        self.counters.total.fetch_add(1, Ordering::Relaxed);

        if let Some(mut snapshot) = self
            .prewarmed
            .as_ref()
            .and_then(|p| p.get(symbol))
            .filter(MarketSnapshot::has_ticker)
        {
            self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            debug!(symbol, "pre-warmed cache hit");
            snapshot.source = SnapshotSource::Prewarmed;
            return snapshot;
        }

        if let Some(mut snapshot) = self.cache.get(symbol) {
            self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            debug!(symbol, "local cache hit");
            snapshot.source = SnapshotSource::LocalCache;
            return snapshot;
        }

        let snapshot = self.collect(symbol).await;
        if snapshot.has_ticker() {
            self.counters.success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
        }
        if !snapshot.missing_fields.is_empty() {
            info!(
                symbol,
                missing = ?snapshot.missing_fields,
                "snapshot collected with unknown fields"
            );
        }
        self.cache.insert(symbol.to_string(), snapshot.clone());
        snapshot
    }

    /// Fetches every symbol with at most `max_concurrent_symbols` in flight.
    /// A symbol that overruns its deadline comes back as an empty snapshot;
    /// other symbols are unaffected.
    pub async fn fetch_batch(&self, symbols: &[Symbol]) -> HashMap<Symbol, MarketSnapshot> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_symbols.max(1)));
        let deadline = Duration::from_secs(self.config.symbol_timeout_secs);
        let mut seen = HashSet::new();

        let tasks = symbols
            .iter()
            .filter(|s| seen.insert(s.as_str()))
            .map(|symbol| {
                let semaphore = semaphore.clone();
                async move {
                    let _permit = semaphore.acquire().await.ok();
                    let snapshot = match tokio::time::timeout(deadline, self.fetch(symbol)).await {
                        Ok(snapshot) => snapshot,
                        Err(_) => {
                            warn!(symbol = %symbol, timeout = ?deadline, "symbol fetch timed out");
                            self.counters.failed.fetch_add(1, Ordering::Relaxed);
                            self.unknown_snapshot(symbol)
                        }
                    };
                    (symbol.clone(), snapshot)
                }
            });

        let results: HashMap<Symbol, MarketSnapshot> = join_all(tasks).await.into_iter().collect();
        info!(
            requested = symbols.len(),
            resolved = results.values().filter(|s| s.has_ticker()).count(),
            "batch fetch complete"
        );
        results
    }

    fn unknown_snapshot(&self, symbol: &str) -> MarketSnapshot {
        let mut snapshot = MarketSnapshot::empty(symbol, self.connector.exchange_id());
        snapshot.missing_fields = ["ticker", "orderbook", "trades", "ohlcv"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        snapshot
    }

    fn fresh_in_stream(&self, symbol: &str, kind: DataKind) -> Option<&StreamingStore> {
        let stream = self.stream.as_deref()?;
        let max_age = Duration::from_secs(self.config.stream_max_age_secs);
        stream.is_fresh(symbol, kind, max_age).then_some(stream)
    }

    fn stream_hit<T>(&self, symbol: &str, field: &str, value: Option<T>) -> Option<T> {
        if value.is_some() {
            self.counters.stream_hits.fetch_add(1, Ordering::Relaxed);
            debug!(symbol, field, "served from stream");
        }
        value
    }

    async fn field<T, F, Fut>(&self, symbol: &str, name: &str, op: F) -> Option<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = FetchResult<T>>,
    {
        match with_retry(&self.retry, name, op).await {
            Ok(value) => Some(value),
            Err(FetchError::Unsupported(method)) => {
                debug!(symbol, field = name, method, "not supported by connector");
                None
            }
            Err(e) => {
                warn!(symbol, field = name, error = %e, "field degraded to unknown");
                None
            }
        }
    }

    async fn ohlcv(&self, symbol: &str, name: String, interval: String) -> (String, Option<Vec<Candle>>) {
        let limit = self.config.ohlcv_limit;
        if let Some(stream) = self.fresh_in_stream(symbol, DataKind::Kline) {
            let streamed = stream
                .klines(symbol, &interval)
                .filter(|candles| candles.len() >= limit)
                .map(|candles| candles[candles.len() - limit..].to_vec());
            let streamed = match streamed {
                Some(candles) if !is_contiguous(&candles, &interval) => {
                    debug!(symbol, timeframe = %name, "stream klines have gaps, fetching history");
                    None
                }
                other => other,
            };
            if let Some(candles) = self.stream_hit(symbol, &name, streamed) {
                return (name, Some(candles));
            }
        }
        let candles = self
            .field(symbol, &name, || self.connector.fetch_ohlcv(symbol, &interval, limit))
            .await
            .filter(|c| !c.is_empty());
        (name, candles)
    }

    async fn collect(&self, symbol: &str) -> MarketSnapshot {
        let caps = self.connector.capabilities();
        let cfg = &self.config;

        let ticker = async {
            if let Some(stream) = self.fresh_in_stream(symbol, DataKind::Ticker) {
                if let Some(t) = self.stream_hit(symbol, "ticker", stream.ticker(symbol)) {
                    return Some(t);
                }
            }
            self.field(symbol, "ticker", || self.connector.fetch_ticker(symbol)).await
        };

        let orderbook = async {
            if let Some(stream) = self.fresh_in_stream(symbol, DataKind::OrderBook) {
                if let Some(b) = self.stream_hit(symbol, "orderbook", stream.orderbook(symbol)) {
                    return Some(b);
                }
            }
            self.field(symbol, "orderbook", || {
                self.connector.fetch_order_book(symbol, cfg.orderbook_depth)
            })
            .await
        };

        let trades = async {
            if let Some(stream) = self.fresh_in_stream(symbol, DataKind::Trades) {
                let newest = stream.trades(symbol).map(|mut trades| {
                    let excess = trades.len().saturating_sub(cfg.trades_limit);
                    trades.drain(..excess);
                    trades
                });
                if let Some(t) = self.stream_hit(symbol, "trades", newest) {
                    return Some(t);
                }
            }
            self.field(symbol, "trades", || self.connector.fetch_trades(symbol, cfg.trades_limit))
                .await
        };

        let ohlcv = join_all(
            cfg.resolved_timeframes()
                .into_iter()
                .map(|(name, interval)| self.ohlcv(symbol, name, interval)),
        );

        let long_short = async {
            if !caps.long_short_ratio {
                return None;
            }
            self.field(symbol, "long_short_ratio", || self.connector.fetch_long_short_ratio(symbol))
                .await
        };

        let risk_limit = async {
            if !caps.risk_limits {
                return None;
            }
            self.field(symbol, "risk_limit", || self.connector.fetch_risk_limits(symbol))
                .await
                .filter(|tiers| !tiers.is_empty())
        };

        let premium = async {
            if !caps.premium_index {
                return None;
            }
            self.field(symbol, "premium_index", || {
                self.connector
                    .fetch_premium_index_kline(symbol, &cfg.premium_timeframe, cfg.premium_limit)
            })
            .await
            .and_then(PremiumIndex::from_klines)
        };

        let taker = async {
            if !caps.taker_ratio {
                return None;
            }
            self.field(symbol, "taker_volume_ratio", || {
                self.connector.calculate_taker_buy_sell_ratio(symbol)
            })
            .await
        };

        let open_interest = async {
            if !caps.open_interest_history {
                return None;
            }
            self.field(symbol, "open_interest", || {
                self.connector.fetch_open_interest_history(symbol, 2)
            })
            .await
            .and_then(OpenInterest::from_history)
        };

        let (ticker, orderbook, trades, ohlcv, long_short, risk_limit, premium, taker, open_interest) = tokio::join!(
            ticker,
            orderbook,
            trades,
            ohlcv,
            long_short,
            risk_limit,
            premium,
            taker,
            open_interest
        );

        let taker = taker.or_else(|| trades.as_deref().and_then(TakerVolumeRatio::from_trades));

        let mut snapshot = MarketSnapshot::empty(symbol, self.connector.exchange_id());
        snapshot.timestamp = Utc::now();
        let mut missing = Vec::new();
        let mut note = |name: &str, present: bool| {
            if !present {
                missing.push(name.to_string());
            }
        };
        note("ticker", ticker.is_some());
        note("orderbook", orderbook.is_some());
        note("trades", trades.is_some());
        for (name, candles) in &ohlcv {
            note(&format!("ohlcv.{name}"), candles.is_some());
        }
        note("long_short_ratio", long_short.is_some());
        note("risk_limit", risk_limit.is_some());
        note("premium_index", premium.is_some());
        note("taker_volume_ratio", taker.is_some());
        note("open_interest", open_interest.is_some());

        snapshot.ticker = ticker;
        snapshot.orderbook = orderbook;
        snapshot.trades = trades;
        snapshot.ohlcv = ohlcv
            .into_iter()
            .filter_map(|(name, candles)| candles.map(|c| (name, c)))
            .collect();
        snapshot.long_short_ratio = long_short;
        snapshot.risk_limit = risk_limit;
        snapshot.premium_index = premium;
        snapshot.taker_volume_ratio = taker;
        snapshot.open_interest = open_interest;
        snapshot.missing_fields = missing;
        snapshot
    }
}

/// Every candle opens exactly one interval after the previous one.
fn is_contiguous(candles: &[Candle], interval: &str) -> bool {
    let Some(step) = interval_seconds(interval) else {
        return false;
    };
    candles
        .windows(2)
        .all(|pair| (pair[1].timestamp - pair[0].timestamp).num_seconds() == step)
}
