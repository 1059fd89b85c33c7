use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Exchange instrument identifier, e.g. `BTCUSDT`.
pub type Symbol = String;

/// One OHLCV bar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// `high` bounds the body from above, `low` from below, nothing negative.
    pub fn is_consistent(&self) -> bool {
        let fields = [self.open, self.high, self.low, self.close, self.volume];
        if fields.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return false;
        }
        self.high >= self.open.max(self.close).max(self.low)
            && self.low <= self.open.min(self.close).min(self.high)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OrderBookLevel {
    pub price: f64,
    pub size: f64,
}

/// Bids are kept best-first (descending), asks best-first (ascending).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBook {
    pub bids: Vec<OrderBookLevel>,
    pub asks: Vec<OrderBookLevel>,
    pub timestamp: DateTime<Utc>,
}

impl OrderBook {
    pub fn best_bid(&self) -> Option<f64> {
        self.bids.first().map(|l| l.price)
    }

    pub fn best_ask(&self) -> Option<f64> {
        self.asks.first().map(|l| l.price)
    }

    pub fn mid_price(&self) -> Option<f64> {
        Some((self.best_bid()? + self.best_ask()?) / 2.0)
    }

    pub fn spread(&self) -> Option<f64> {
        Some(self.best_ask()? - self.best_bid()?)
    }

    /// True when both sides are populated and the best bid reaches the best ask.
    pub fn is_crossed(&self) -> bool {
        matches!((self.best_bid(), self.best_ask()), (Some(b), Some(a)) if b >= a)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    /// Accepts the spellings exchanges use (`Buy`, `BUY`, `b`, `sell`, ...).
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "buy" | "b" | "bid" | "long" => Some(TradeSide::Buy),
            "sell" | "s" | "ask" | "short" => Some(TradeSide::Sell),
            _ => None,
        }
    }
}

/// Public trade print. `size` may arrive under several names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    #[serde(default)]
    pub id: Option<String>,
    pub price: f64,
    #[serde(default, alias = "amount", alias = "qty", alias = "quantity", alias = "volume")]
    pub size: Option<f64>,
    #[serde(default)]
    pub side: Option<TradeSide>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: Symbol,
    pub last: Option<f64>,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub volume: Option<f64>,
    pub quote_volume: Option<f64>,
    pub change_pct: Option<f64>,
    pub mark_price: Option<f64>,
    pub index_price: Option<f64>,
    pub funding_rate: Option<f64>,
    pub open_interest: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl Ticker {
    pub fn new(symbol: impl Into<Symbol>, timestamp: DateTime<Utc>) -> Self {
        Self {
            symbol: symbol.into(),
            last: None,
            bid: None,
            ask: None,
            open: None,
            high: None,
            low: None,
            volume: None,
            quote_volume: None,
            change_pct: None,
            mark_price: None,
            index_price: None,
            funding_rate: None,
            open_interest: None,
            timestamp,
        }
    }

    /// Price-like fields, by name, that are present on this ticker.
    pub fn price_fields(&self) -> Vec<(&'static str, f64)> {
        [
            ("last", self.last),
            ("bid", self.bid),
            ("ask", self.ask),
            ("open", self.open),
            ("high", self.high),
            ("low", self.low),
            ("mark_price", self.mark_price),
            ("index_price", self.index_price),
        ]
        .into_iter()
        .filter_map(|(name, v)| v.map(|v| (name, v)))
        .collect()
    }

    /// Best available reference price: last, then mark, then mid of bid/ask.
    pub fn reference_price(&self) -> Option<f64> {
        self.last.or(self.mark_price).or(match (self.bid, self.ask) {
            (Some(b), Some(a)) => Some((a + b) / 2.0),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OpenInterestPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenInterest {
    pub current: f64,
    pub previous: f64,
    pub change_pct: f64,
    pub history: Vec<OpenInterestPoint>,
}

impl OpenInterest {
    /// Builds the current/previous pair from history points in any order.
    ///
    /// With a single point the previous value equals the current one, so
    /// the change is zero rather than undefined.
    pub fn from_history(mut history: Vec<OpenInterestPoint>) -> Option<Self> {
        history.sort_by_key(|p| p.timestamp);
        let current = history.last()?.value;
        let previous = if history.len() >= 2 {
            history[history.len() - 2].value
        } else {
            current
        };
        let change_pct = if previous != 0.0 {
            (current - previous) / previous * 100.0
        } else {
            0.0
        };
        Some(Self {
            current,
            previous,
            change_pct,
            history,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LongShortRatio {
    pub long_ratio: f64,
    pub short_ratio: f64,
    pub timestamp: DateTime<Utc>,
}

impl LongShortRatio {
    pub fn ratio(&self) -> Option<f64> {
        (self.short_ratio > 0.0).then(|| self.long_ratio / self.short_ratio)
    }
}

/// One risk-limit tier of a perpetual contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskLimit {
    pub id: u32,
    pub limit: f64,
    pub maintenance_margin: f64,
    pub initial_margin: f64,
    pub max_leverage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PremiumIndex {
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    pub history: Vec<Candle>,
}

impl PremiumIndex {
    /// Latest close of a premium-index kline series.
    pub fn from_klines(mut history: Vec<Candle>) -> Option<Self> {
        history.sort_by_key(|c| c.timestamp);
        let last = history.last()?;
        Some(Self {
            value: last.close,
            timestamp: last.timestamp,
            history,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TakerVolumeRatio {
    pub buy_volume: f64,
    pub sell_volume: f64,
    pub ratio: Option<f64>,
}

impl TakerVolumeRatio {
    pub fn new(buy_volume: f64, sell_volume: f64) -> Self {
        let ratio = (sell_volume > 0.0).then(|| buy_volume / sell_volume);
        Self {
            buy_volume,
            sell_volume,
            ratio,
        }
    }

    /// Aggressor-side volume split from trade prints. Trades without a side
    /// or a size are skipped; `None` if nothing usable remains.
    pub fn from_trades(trades: &[Trade]) -> Option<Self> {
        let mut buy = 0.0;
        let mut sell = 0.0;
        let mut seen = false;
        for t in trades {
            let (Some(side), Some(size)) = (t.side, t.size) else {
                continue;
            };
            seen = true;
            match side {
                TradeSide::Buy => buy += size,
                TradeSide::Sell => sell += size,
            }
        }
        seen.then(|| Self::new(buy, sell))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Liquidation {
    pub symbol: Symbol,
    pub side: Option<TradeSide>,
    pub price: f64,
    pub size: f64,
    pub timestamp: DateTime<Utc>,
}

/// Kinds of data the streaming store tracks freshness for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataKind {
    Ticker,
    OrderBook,
    Trades,
    Kline,
    Liquidations,
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DataKind::Ticker => "ticker",
            DataKind::OrderBook => "orderbook",
            DataKind::Trades => "trades",
            DataKind::Kline => "kline",
            DataKind::Liquidations => "liquidations",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotSource {
    Network,
    LocalCache,
    Prewarmed,
}

/// Everything known about one symbol at one moment.
///
/// `None` means the field could not be resolved; it is never a stand-in for
/// zero. `missing_fields` names the fields that degraded during collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub symbol: Symbol,
    pub exchange_id: String,
    pub timestamp: DateTime<Utc>,
    pub ticker: Option<Ticker>,
    pub orderbook: Option<OrderBook>,
    pub trades: Option<Vec<Trade>>,
    pub ohlcv: BTreeMap<String, Vec<Candle>>,
    pub premium_index: Option<PremiumIndex>,
    pub taker_volume_ratio: Option<TakerVolumeRatio>,
    pub open_interest: Option<OpenInterest>,
    pub long_short_ratio: Option<LongShortRatio>,
    pub risk_limit: Option<Vec<RiskLimit>>,
    #[serde(default)]
    pub missing_fields: Vec<String>,
    pub source: SnapshotSource,
}

impl MarketSnapshot {
    pub fn empty(symbol: impl Into<Symbol>, exchange_id: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            exchange_id: exchange_id.into(),
            timestamp: Utc::now(),
            ticker: None,
            orderbook: None,
            trades: None,
            ohlcv: BTreeMap::new(),
            premium_index: None,
            taker_volume_ratio: None,
            open_interest: None,
            long_short_ratio: None,
            risk_limit: None,
            missing_fields: Vec::new(),
            source: SnapshotSource::Network,
        }
    }

    pub fn has_ticker(&self) -> bool {
        self.ticker.is_some()
    }

    pub fn is_missing(&self, field: &str) -> bool {
        self.missing_fields.iter().any(|f| f == field)
    }

    /// Reference price used for entries: ticker first, then orderbook mid.
    pub fn reference_price(&self) -> Option<f64> {
        self.ticker
            .as_ref()
            .and_then(Ticker::reference_price)
            .or_else(|| self.orderbook.as_ref().and_then(OrderBook::mid_price))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap()
    }

    fn candle(open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle {
            timestamp: ts(0),
            open,
            high,
            low,
            close,
            volume: 1.0,
        }
    }

    #[test]
    fn test_candle_consistency() {
        assert!(candle(10.0, 12.0, 9.0, 11.0).is_consistent());
        assert!(!candle(10.0, 10.5, 9.0, 11.0).is_consistent());
        assert!(!candle(10.0, 12.0, 10.5, 11.0).is_consistent());
        assert!(!candle(-1.0, 12.0, 0.0, 11.0).is_consistent());
    }

    #[test]
    fn test_open_interest_single_point_has_zero_delta() {
        let oi = OpenInterest::from_history(vec![OpenInterestPoint {
            timestamp: ts(60),
            value: 1_000.0,
        }])
        .unwrap();
        assert_eq!(oi.previous, oi.current);
        assert_eq!(oi.change_pct, 0.0);
    }

    #[test]
    fn test_open_interest_orders_history() {
        let oi = OpenInterest::from_history(vec![
            OpenInterestPoint { timestamp: ts(120), value: 110.0 },
            OpenInterestPoint { timestamp: ts(60), value: 100.0 },
        ])
        .unwrap();
        assert_eq!(oi.current, 110.0);
        assert_eq!(oi.previous, 100.0);
        assert!((oi.change_pct - 10.0).abs() < 1e-9);
        assert!(OpenInterest::from_history(vec![]).is_none());
    }

    #[test]
    fn test_taker_ratio_from_trades() {
        let trades = vec![
            Trade { id: None, price: 1.0, size: Some(3.0), side: Some(TradeSide::Buy), timestamp: ts(1) },
            Trade { id: None, price: 1.0, size: Some(1.0), side: Some(TradeSide::Sell), timestamp: ts(2) },
            Trade { id: None, price: 1.0, size: None, side: Some(TradeSide::Sell), timestamp: ts(3) },
        ];
        let ratio = TakerVolumeRatio::from_trades(&trades).unwrap();
        assert_eq!(ratio.buy_volume, 3.0);
        assert_eq!(ratio.ratio, Some(3.0));
    }

    #[test]
    fn test_trade_size_aliases() {
        let t: Trade = serde_json::from_str(
            r#"{"price": 10.5, "qty": 0.25, "timestamp": "2024-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(t.size, Some(0.25));
    }

    #[test]
    fn test_orderbook_crossed() {
        let book = OrderBook {
            bids: vec![OrderBookLevel { price: 101.0, size: 1.0 }],
            asks: vec![OrderBookLevel { price: 100.0, size: 1.0 }],
            timestamp: ts(0),
        };
        assert!(book.is_crossed());
        assert_eq!(book.mid_price(), Some(100.5));
    }
}
