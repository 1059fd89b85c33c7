//! Bybit v5 public market REST connector (linear perpetuals).

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{
    interval_seconds, Candle, LongShortRatio, OpenInterestPoint, OrderBook, OrderBookLevel,
    RiskLimit, TakerVolumeRatio, Ticker, Trade, TradeSide,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{ConnectorCapabilities, ExchangeConnector};
use crate::error::{FetchError, FetchResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BybitConfig {
    #[serde(default = "default_rest_url")]
    pub rest_url: String,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    /// Period used for long/short ratio and open interest history
    #[serde(default = "default_stats_period")]
    pub stats_period: String,
}

impl Default for BybitConfig {
    fn default() -> Self {
        Self {
            rest_url: default_rest_url(),
            category: default_category(),
            http_timeout_secs: default_http_timeout_secs(),
            stats_period: default_stats_period(),
        }
    }
}

fn default_rest_url() -> String {
    "https://api.bybit.com".to_string()
}

fn default_category() -> String {
    "linear".to_string()
}

fn default_http_timeout_secs() -> u64 {
    10
}

fn default_stats_period() -> String {
    "5min".to_string()
}

pub struct BybitConnector {
    config: BybitConfig,
    client: reqwest::Client,
}

/// Every v5 response is wrapped in this envelope.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(rename = "retCode")]
    ret_code: i64,
    #[serde(rename = "retMsg")]
    ret_msg: String,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct ListResult<T> {
    #[serde(default = "Vec::new")]
    list: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTicker {
    symbol: String,
    #[serde(default)]
    last_price: String,
    #[serde(default)]
    bid1_price: String,
    #[serde(default)]
    ask1_price: String,
    #[serde(default)]
    prev_price24h: String,
    #[serde(default)]
    high_price24h: String,
    #[serde(default)]
    low_price24h: String,
    #[serde(default)]
    volume24h: String,
    #[serde(default)]
    turnover24h: String,
    #[serde(default)]
    price24h_pcnt: String,
    #[serde(default)]
    mark_price: String,
    #[serde(default)]
    index_price: String,
    #[serde(default)]
    funding_rate: String,
    #[serde(default)]
    open_interest: String,
}

#[derive(Debug, Deserialize)]
struct RawOrderBook {
    #[serde(rename = "b")]
    bids: Vec<[String; 2]>,
    #[serde(rename = "a")]
    asks: Vec<[String; 2]>,
    ts: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTrade {
    exec_id: String,
    price: String,
    size: String,
    side: String,
    time: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawAccountRatio {
    buy_ratio: String,
    sell_ratio: String,
    timestamp: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRiskLimit {
    id: u32,
    risk_limit_value: String,
    maintenance_margin: String,
    initial_margin: String,
    max_leverage: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawOpenInterest {
    open_interest: String,
    timestamp: String,
}

impl BybitConnector {
    pub fn new(config: BybitConfig) -> FetchResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()?;
        Ok(Self { config, client })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> FetchResult<T> {
        let url = format!("{}{}", self.config.rest_url, path);
        debug!(%url, ?query, "bybit GET");

        let envelope: Envelope<T> = self
            .client
            .get(&url)
            .query(&[("category", self.config.category.as_str())])
            .query(query)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if envelope.ret_code != 0 {
            return Err(FetchError::Exchange {
                code: envelope.ret_code,
                message: envelope.ret_msg,
            });
        }
        envelope
            .result
            .ok_or_else(|| FetchError::Empty(path.to_string()))
    }

    async fn get_list<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> FetchResult<Vec<T>> {
        let result: ListResult<T> = self.get(path, query).await?;
        Ok(result.list)
    }

    async fn klines(&self, path: &str, symbol: &str, timeframe: &str, limit: usize) -> FetchResult<Vec<Candle>> {
        let interval = bybit_interval(timeframe)?;
        let rows: Vec<Vec<String>> = self
            .get_list(
                path,
                &[
                    ("symbol", symbol.to_string()),
                    ("interval", interval),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;

        // newest first on the wire
        let mut candles = rows
            .iter()
            .map(|row| parse_kline_row(row))
            .collect::<FetchResult<Vec<_>>>()?;
        candles.sort_by_key(|c| c.timestamp);
        candles.dedup_by_key(|c| c.timestamp);
        Ok(candles)
    }
}

#[async_trait]
impl ExchangeConnector for BybitConnector {
    fn exchange_id(&self) -> &str {
        "bybit"
    }

    fn capabilities(&self) -> ConnectorCapabilities {
        ConnectorCapabilities::all()
    }

    async fn fetch_ticker(&self, symbol: &str) -> FetchResult<Ticker> {
        let list: Vec<RawTicker> = self
            .get_list("/v5/market/tickers", &[("symbol", symbol.to_string())])
            .await?;
        let raw = list
            .into_iter()
            .next()
            .ok_or_else(|| FetchError::Empty(format!("ticker {symbol}")))?;

        let mut ticker = Ticker::new(raw.symbol, Utc::now());
        ticker.last = opt_f64(&raw.last_price);
        ticker.bid = opt_f64(&raw.bid1_price);
        ticker.ask = opt_f64(&raw.ask1_price);
        ticker.open = opt_f64(&raw.prev_price24h);
        ticker.high = opt_f64(&raw.high_price24h);
        ticker.low = opt_f64(&raw.low_price24h);
        ticker.volume = opt_f64(&raw.volume24h);
        ticker.quote_volume = opt_f64(&raw.turnover24h);
        ticker.change_pct = opt_f64(&raw.price24h_pcnt).map(|p| p * 100.0);
        ticker.mark_price = opt_f64(&raw.mark_price);
        ticker.index_price = opt_f64(&raw.index_price);
        ticker.funding_rate = opt_f64(&raw.funding_rate);
        ticker.open_interest = opt_f64(&raw.open_interest);
        Ok(ticker)
    }

    async fn fetch_order_book(&self, symbol: &str, depth: usize) -> FetchResult<OrderBook> {
        let raw: RawOrderBook = self
            .get(
                "/v5/market/orderbook",
                &[("symbol", symbol.to_string()), ("limit", depth.to_string())],
            )
            .await?;
        Ok(OrderBook {
            bids: parse_levels(&raw.bids)?,
            asks: parse_levels(&raw.asks)?,
            timestamp: millis_to_datetime(raw.ts)?,
        })
    }

    async fn fetch_trades(&self, symbol: &str, limit: usize) -> FetchResult<Vec<Trade>> {
        let list: Vec<RawTrade> = self
            .get_list(
                "/v5/market/recent-trade",
                &[("symbol", symbol.to_string()), ("limit", limit.to_string())],
            )
            .await?;
        let mut trades = list
            .into_iter()
            .map(|raw| {
                Ok(Trade {
                    id: Some(raw.exec_id),
                    price: parse_f64(&raw.price)?,
                    size: opt_f64(&raw.size),
                    side: TradeSide::parse(&raw.side),
                    timestamp: millis_to_datetime(parse_i64(&raw.time)?)?,
                })
            })
            .collect::<FetchResult<Vec<_>>>()?;
        trades.sort_by_key(|t| t.timestamp);
        Ok(trades)
    }

    async fn fetch_ohlcv(&self, symbol: &str, timeframe: &str, limit: usize) -> FetchResult<Vec<Candle>> {
        self.klines("/v5/market/kline", symbol, timeframe, limit).await
    }

    async fn fetch_long_short_ratio(&self, symbol: &str) -> FetchResult<LongShortRatio> {
        let list: Vec<RawAccountRatio> = self
            .get_list(
                "/v5/market/account-ratio",
                &[
                    ("symbol", symbol.to_string()),
                    ("period", self.config.stats_period.clone()),
                    ("limit", "1".to_string()),
                ],
            )
            .await?;
        let raw = list
            .into_iter()
            .next()
            .ok_or_else(|| FetchError::Empty(format!("long/short ratio {symbol}")))?;
        Ok(LongShortRatio {
            long_ratio: parse_f64(&raw.buy_ratio)?,
            short_ratio: parse_f64(&raw.sell_ratio)?,
            timestamp: millis_to_datetime(parse_i64(&raw.timestamp)?)?,
        })
    }

    async fn fetch_risk_limits(&self, symbol: &str) -> FetchResult<Vec<RiskLimit>> {
        let list: Vec<RawRiskLimit> = self
            .get_list("/v5/market/risk-limit", &[("symbol", symbol.to_string())])
            .await?;
        list.into_iter()
            .map(|raw| {
                Ok(RiskLimit {
                    id: raw.id,
                    limit: parse_f64(&raw.risk_limit_value)?,
                    maintenance_margin: parse_f64(&raw.maintenance_margin)?,
                    initial_margin: parse_f64(&raw.initial_margin)?,
                    max_leverage: parse_f64(&raw.max_leverage)?,
                })
            })
            .collect()
    }

    async fn fetch_premium_index_kline(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
    ) -> FetchResult<Vec<Candle>> {
        self.klines("/v5/market/premium-index-price-kline", symbol, timeframe, limit)
            .await
    }

    /// Bybit publishes no aggregate, so it is derived from the latest prints.
    async fn calculate_taker_buy_sell_ratio(&self, symbol: &str) -> FetchResult<TakerVolumeRatio> {
        let trades = self.fetch_trades(symbol, 1000).await?;
        TakerVolumeRatio::from_trades(&trades)
            .ok_or_else(|| FetchError::Empty(format!("taker volume {symbol}")))
    }

    async fn fetch_open_interest_history(
        &self,
        symbol: &str,
        limit: usize,
    ) -> FetchResult<Vec<OpenInterestPoint>> {
        let list: Vec<RawOpenInterest> = self
            .get_list(
                "/v5/market/open-interest",
                &[
                    ("symbol", symbol.to_string()),
                    ("intervalTime", self.config.stats_period.clone()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;
        list.into_iter()
            .map(|raw| {
                Ok(OpenInterestPoint {
                    timestamp: millis_to_datetime(parse_i64(&raw.timestamp)?)?,
                    value: parse_f64(&raw.open_interest)?,
                })
            })
            .collect()
    }
}

/// Canonical timeframe (`"1h"`) to Bybit's interval token (`"60"`).
pub fn bybit_interval(timeframe: &str) -> FetchResult<String> {
    let secs = interval_seconds(timeframe)
        .ok_or_else(|| FetchError::InvalidPayload(format!("unsupported timeframe {timeframe}")))?;
    let token = match secs / 60 {
        1440 => "D".to_string(),
        10080 => "W".to_string(),
        m @ (1 | 3 | 5 | 15 | 30 | 60 | 120 | 240 | 360 | 720) => m.to_string(),
        _ => {
            return Err(FetchError::InvalidPayload(format!(
                "bybit has no {timeframe} interval"
            )))
        }
    };
    Ok(token)
}

fn parse_kline_row(row: &[String]) -> FetchResult<Candle> {
    if row.len() < 5 {
        return Err(FetchError::InvalidPayload(format!("short kline row: {row:?}")));
    }
    Ok(Candle {
        timestamp: millis_to_datetime(parse_i64(&row[0])?)?,
        open: parse_f64(&row[1])?,
        high: parse_f64(&row[2])?,
        low: parse_f64(&row[3])?,
        close: parse_f64(&row[4])?,
        // premium index klines carry no volume column
        volume: row.get(5).and_then(|v| opt_f64(v)).unwrap_or(0.0),
    })
}

fn parse_levels(raw: &[[String; 2]]) -> FetchResult<Vec<OrderBookLevel>> {
    raw.iter()
        .map(|[price, size]| {
            Ok(OrderBookLevel {
                price: parse_f64(price)?,
                size: parse_f64(size)?,
            })
        })
        .collect()
}

fn parse_f64(raw: &str) -> FetchResult<f64> {
    raw.parse::<f64>()
        .map_err(|_| FetchError::InvalidPayload(format!("not a number: {raw:?}")))
}

fn parse_i64(raw: &str) -> FetchResult<i64> {
    raw.parse::<i64>()
        .map_err(|_| FetchError::InvalidPayload(format!("not an integer: {raw:?}")))
}

/// Empty strings are how Bybit reports "not available".
fn opt_f64(raw: &str) -> Option<f64> {
    if raw.is_empty() {
        None
    } else {
        raw.parse().ok()
    }
}

fn millis_to_datetime(ms: i64) -> FetchResult<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| FetchError::InvalidPayload(format!("timestamp out of range: {ms}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_tokens() {
        assert_eq!(bybit_interval("1m").unwrap(), "1");
        assert_eq!(bybit_interval("1h").unwrap(), "60");
        assert_eq!(bybit_interval("4h").unwrap(), "240");
        assert_eq!(bybit_interval("1d").unwrap(), "D");
        assert!(bybit_interval("7m").is_err());
    }

    #[test]
    fn test_parse_ticker_envelope() {
        let json = r#"{
            "retCode": 0,
            "retMsg": "OK",
            "result": {
                "category": "linear",
                "list": [{
                    "symbol": "BTCUSDT",
                    "lastPrice": "64000.5",
                    "bid1Price": "64000.0",
                    "ask1Price": "64001.0",
                    "prevPrice24h": "63000",
                    "highPrice24h": "64500",
                    "lowPrice24h": "62800",
                    "volume24h": "12000",
                    "turnover24h": "768000000",
                    "price24hPcnt": "0.0159",
                    "markPrice": "64000.2",
                    "indexPrice": "63999.8",
                    "fundingRate": "0.0001",
                    "openInterest": "55000",
                    "deliveryTime": ""
                }]
            },
            "time": 1708627200000
        }"#;
        let env: Envelope<ListResult<RawTicker>> = serde_json::from_str(json).unwrap();
        assert_eq!(env.ret_code, 0);
        let raw = &env.result.unwrap().list[0];
        assert_eq!(opt_f64(&raw.last_price), Some(64000.5));
        assert_eq!(opt_f64(&raw.bid1_price), Some(64000.0));
    }

    #[test]
    fn test_parse_kline_rows_handles_missing_volume() {
        let row: Vec<String> = ["1708627200000", "1.0", "2.0", "0.5", "1.5"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let candle = parse_kline_row(&row).unwrap();
        assert_eq!(candle.close, 1.5);
        assert_eq!(candle.volume, 0.0);

        let short: Vec<String> = vec!["1".into(), "2".into()];
        assert!(parse_kline_row(&short).is_err());
    }

    #[test]
    fn test_empty_string_is_unknown() {
        assert_eq!(opt_f64(""), None);
        assert_eq!(opt_f64("1.25"), Some(1.25));
        assert!(parse_f64("abc").is_err());
    }
}
