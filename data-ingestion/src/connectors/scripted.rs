//! Deterministic in-process connector.
//!
//! Produces synthetic but internally consistent market data around a base
//! price, counts every call, and can be told to fail or stall individual
//! methods. Used by tests across the workspace and by offline demos.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use common::{
    interval_seconds, Candle, LongShortRatio, OpenInterestPoint, OrderBook, OrderBookLevel,
    RiskLimit, TakerVolumeRatio, Ticker, Trade, TradeSide,
};

use super::{ConnectorCapabilities, ExchangeConnector};
use crate::error::{FetchError, FetchResult};

pub const FETCH_TICKER: &str = "fetch_ticker";
pub const FETCH_ORDER_BOOK: &str = "fetch_order_book";
pub const FETCH_TRADES: &str = "fetch_trades";
pub const FETCH_OHLCV: &str = "fetch_ohlcv";
pub const FETCH_LONG_SHORT_RATIO: &str = "fetch_long_short_ratio";
pub const FETCH_RISK_LIMITS: &str = "fetch_risk_limits";
pub const FETCH_PREMIUM_INDEX: &str = "fetch_premium_index_kline";
pub const TAKER_RATIO: &str = "calculate_taker_buy_sell_ratio";
pub const FETCH_OPEN_INTEREST: &str = "fetch_open_interest_history";

pub struct ScriptedConnector {
    exchange_id: String,
    capabilities: ConnectorCapabilities,
    base_price: f64,
    open_interest_points: usize,
    failing: HashSet<&'static str>,
    failing_symbols: HashSet<String>,
    delays: HashMap<&'static str, Duration>,
    calls: Mutex<HashMap<&'static str, usize>>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self {
            exchange_id: "scripted".to_string(),
            capabilities: ConnectorCapabilities::all(),
            base_price: 100.0,
            open_interest_points: 2,
            failing: HashSet::new(),
            failing_symbols: HashSet::new(),
            delays: HashMap::new(),
            calls: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_capabilities(mut self, capabilities: ConnectorCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_base_price(mut self, price: f64) -> Self {
        self.base_price = price;
        self
    }

    pub fn with_open_interest_points(mut self, points: usize) -> Self {
        self.open_interest_points = points;
        self
    }

    /// Every call to `method` fails with a retryable error.
    pub fn failing(mut self, method: &'static str) -> Self {
        self.failing.insert(method);
        self
    }

    /// Every call for `symbol` fails, whatever the method.
    pub fn failing_symbol(mut self, symbol: &str) -> Self {
        self.failing_symbols.insert(symbol.to_string());
        self
    }

    pub fn with_delay(mut self, method: &'static str, delay: Duration) -> Self {
        self.delays.insert(method, delay);
        self
    }

    pub fn calls(&self, method: &str) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(method)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .sum()
    }

    async fn enter(&self, method: &'static str, symbol: &str) -> FetchResult<()> {
        *self
            .calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(method)
            .or_insert(0) += 1;

        if let Some(delay) = self.delays.get(method) {
            tokio::time::sleep(*delay).await;
        }
        if self.failing.contains(method) || self.failing_symbols.contains(symbol) {
            return Err(FetchError::Exchange {
                code: 10_016,
                message: format!("scripted failure in {method}"),
            });
        }
        Ok(())
    }

    fn series(&self, end: DateTime<Utc>, step_secs: i64, limit: usize) -> Vec<Candle> {
        (0..limit)
            .rev()
            .map(|i| {
                let drift = (i % 7) as f64 * 0.1;
                let open = self.base_price - drift;
                let close = self.base_price + drift;
                Candle {
                    timestamp: end - ChronoDuration::seconds(step_secs * i as i64),
                    open,
                    high: open.max(close) + 0.5,
                    low: open.min(close) - 0.5,
                    close,
                    volume: 10.0 + i as f64,
                }
            })
            .collect()
    }
}

impl Default for ScriptedConnector {
    fn default() -> Self {
        Self::new()
    }
}

/// Current time truncated to whole seconds, so every series built in the same
/// call shares the same final timestamp.
fn series_end() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::<Utc>::from_timestamp(now.timestamp(), 0).unwrap_or(now)
}

#[async_trait]
impl ExchangeConnector for ScriptedConnector {
    fn exchange_id(&self) -> &str {
        &self.exchange_id
    }

    fn capabilities(&self) -> ConnectorCapabilities {
        self.capabilities
    }

    async fn fetch_ticker(&self, symbol: &str) -> FetchResult<Ticker> {
        self.enter(FETCH_TICKER, symbol).await?;
        let mut ticker = Ticker::new(symbol, Utc::now());
        ticker.last = Some(self.base_price);
        ticker.bid = Some(self.base_price - 0.5);
        ticker.ask = Some(self.base_price + 0.5);
        ticker.open = Some(self.base_price - 1.0);
        ticker.high = Some(self.base_price + 2.0);
        ticker.low = Some(self.base_price - 2.0);
        ticker.volume = Some(12_345.0);
        ticker.quote_volume = Some(12_345.0 * self.base_price);
        ticker.change_pct = Some(1.0);
        ticker.mark_price = Some(self.base_price);
        ticker.index_price = Some(self.base_price);
        ticker.funding_rate = Some(0.0001);
        ticker.open_interest = Some(50_000.0);
        Ok(ticker)
    }

    async fn fetch_order_book(&self, symbol: &str, depth: usize) -> FetchResult<OrderBook> {
        self.enter(FETCH_ORDER_BOOK, symbol).await?;
        let level = |price: f64| OrderBookLevel { price, size: 1.0 };
        Ok(OrderBook {
            bids: (0..depth).map(|i| level(self.base_price - 0.5 - i as f64 * 0.5)).collect(),
            asks: (0..depth).map(|i| level(self.base_price + 0.5 + i as f64 * 0.5)).collect(),
            timestamp: Utc::now(),
        })
    }

    async fn fetch_trades(&self, symbol: &str, limit: usize) -> FetchResult<Vec<Trade>> {
        self.enter(FETCH_TRADES, symbol).await?;
        let now = Utc::now();
        Ok((0..limit)
            .map(|i| Trade {
                id: Some(format!("t-{i}")),
                price: self.base_price,
                size: Some(1.0 + (i % 3) as f64),
                side: Some(if i % 2 == 0 { TradeSide::Buy } else { TradeSide::Sell }),
                timestamp: now - ChronoDuration::milliseconds((limit - i) as i64 * 100),
            })
            .collect())
    }

    async fn fetch_ohlcv(&self, symbol: &str, timeframe: &str, limit: usize) -> FetchResult<Vec<Candle>> {
        self.enter(FETCH_OHLCV, symbol).await?;
        let step = interval_seconds(timeframe)
            .ok_or_else(|| FetchError::InvalidPayload(format!("unknown timeframe {timeframe}")))?;
        Ok(self.series(series_end(), step, limit))
    }

    async fn fetch_long_short_ratio(&self, symbol: &str) -> FetchResult<LongShortRatio> {
        self.enter(FETCH_LONG_SHORT_RATIO, symbol).await?;
        Ok(LongShortRatio {
            long_ratio: 0.55,
            short_ratio: 0.45,
            timestamp: Utc::now(),
        })
    }

    async fn fetch_risk_limits(&self, symbol: &str) -> FetchResult<Vec<RiskLimit>> {
        self.enter(FETCH_RISK_LIMITS, symbol).await?;
        Ok(vec![RiskLimit {
            id: 1,
            limit: 2_000_000.0,
            maintenance_margin: 0.005,
            initial_margin: 0.01,
            max_leverage: 100.0,
        }])
    }

    async fn fetch_premium_index_kline(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
    ) -> FetchResult<Vec<Candle>> {
        self.enter(FETCH_PREMIUM_INDEX, symbol).await?;
        let step = interval_seconds(timeframe).unwrap_or(60);
        Ok((0..limit)
            .rev()
            .map(|i| Candle {
                timestamp: series_end() - ChronoDuration::seconds(step * i as i64),
                open: 0.0001,
                high: 0.0002,
                low: 0.0,
                close: 0.00015,
                volume: 0.0,
            })
            .collect())
    }

    async fn calculate_taker_buy_sell_ratio(&self, symbol: &str) -> FetchResult<TakerVolumeRatio> {
        self.enter(TAKER_RATIO, symbol).await?;
        Ok(TakerVolumeRatio::new(60.0, 40.0))
    }

    async fn fetch_open_interest_history(
        &self,
        symbol: &str,
        limit: usize,
    ) -> FetchResult<Vec<OpenInterestPoint>> {
        self.enter(FETCH_OPEN_INTEREST, symbol).await?;
        let now = Utc::now();
        Ok((0..self.open_interest_points.min(limit))
            .map(|i| OpenInterestPoint {
                // newest first, as most venues return it
                timestamp: now - ChronoDuration::minutes(5 * i as i64),
                value: 50_000.0 - 500.0 * i as f64,
            })
            .collect())
    }
}
