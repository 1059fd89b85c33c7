// Per-kind data rules
// Each check returns the issues it found; an empty list means the data passed.

use chrono::{DateTime, Duration, Utc};
use common::{Candle, OrderBook, OrderBookLevel, Ticker, Trade};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Lowers quality, never fails validation
    Warning,
    /// Fails validation in strict mode
    Violation,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationIssue {
    pub field: String,
    pub severity: Severity,
    pub message: String,
}

impl ValidationIssue {
    pub fn violation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            severity: Severity::Violation,
            message: message.into(),
        }
    }

    pub fn warning(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            severity: Severity::Warning,
            message: message.into(),
        }
    }

    pub fn is_violation(&self) -> bool {
        self.severity == Severity::Violation
    }
}

/// OHLC bounds, non-negative fields, strictly increasing unique timestamps.
pub fn check_candles(field: &str, candles: &[Candle]) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    for (i, candle) in candles.iter().enumerate() {
        if !candle.is_consistent() {
            issues.push(ValidationIssue::violation(
                field,
                format!(
                    "candle {i} at {} breaks OHLC bounds (o={} h={} l={} c={} v={})",
                    candle.timestamp, candle.open, candle.high, candle.low, candle.close, candle.volume
                ),
            ));
        }
    }
    for (i, pair) in candles.windows(2).enumerate() {
        if pair[1].timestamp <= pair[0].timestamp {
            issues.push(ValidationIssue::violation(
                field,
                format!(
                    "timestamps not strictly increasing at {}: {} then {}",
                    i + 1,
                    pair[0].timestamp,
                    pair[1].timestamp
                ),
            ));
        }
    }
    issues
}

fn check_side(
    side: &str,
    levels: &[OrderBookLevel],
    prefix: usize,
    in_order: impl Fn(f64, f64) -> bool,
) -> Vec<ValidationIssue> {
    let field = format!("orderbook.{side}");
    let levels = &levels[..levels.len().min(prefix)];
    let mut issues = Vec::new();
    for (i, level) in levels.iter().enumerate() {
        if !(level.price.is_finite() && level.price > 0.0 && level.size.is_finite() && level.size >= 0.0) {
            issues.push(ValidationIssue::violation(
                &field,
                format!("level {i} has invalid price/size {}/{}", level.price, level.size),
            ));
        }
    }
    for (i, pair) in levels.windows(2).enumerate() {
        if !in_order(pair[0].price, pair[1].price) {
            issues.push(ValidationIssue::violation(
                &field,
                format!("levels {i} and {} out of order: {} then {}", i + 1, pair[0].price, pair[1].price),
            ));
            break;
        }
    }
    issues
}

/// Bids strictly descending and asks strictly ascending over the first
/// `prefix` levels; best bid below best ask.
pub fn check_orderbook(book: &OrderBook, prefix: usize) -> Vec<ValidationIssue> {
    let mut issues = check_side("bids", &book.bids, prefix, |a, b| a > b);
    issues.extend(check_side("asks", &book.asks, prefix, |a, b| a < b));
    if book.is_crossed() {
        issues.push(ValidationIssue::violation(
            "orderbook",
            format!(
                "crossed book: best bid {:?} >= best ask {:?}",
                book.best_bid(),
                book.best_ask()
            ),
        ));
    }
    if book.bids.is_empty() || book.asks.is_empty() {
        issues.push(ValidationIssue::warning("orderbook", "one side of the book is empty"));
    }
    issues
}

/// Every trade needs a positive price and a size. An empty list is fine.
pub fn check_trades(trades: &[Trade]) -> Vec<ValidationIssue> {
    trades
        .iter()
        .enumerate()
        .filter_map(|(i, t)| {
            if !(t.price.is_finite() && t.price > 0.0) {
                Some(ValidationIssue::violation("trades", format!("trade {i} has price {}", t.price)))
            } else if t.size.map_or(true, |s| !s.is_finite() || s < 0.0) {
                Some(ValidationIssue::violation("trades", format!("trade {i} has no usable size")))
            } else {
                None
            }
        })
        .collect()
}

/// Present price fields must be non-negative. Missing secondary fields only
/// lower quality; a ticker with no usable price at all is a violation.
pub fn check_ticker(ticker: &Ticker) -> Vec<ValidationIssue> {
    let mut issues: Vec<ValidationIssue> = ticker
        .price_fields()
        .into_iter()
        .filter(|(_, v)| !v.is_finite() || *v < 0.0)
        .map(|(name, v)| ValidationIssue::violation(format!("ticker.{name}"), format!("{name} is {v}")))
        .collect();

    if ticker.reference_price().is_none() {
        issues.push(ValidationIssue::violation("ticker", "no last, mark or bid/ask price"));
    }
    let secondary = [
        ("bid", ticker.bid),
        ("ask", ticker.ask),
        ("high", ticker.high),
        ("low", ticker.low),
        ("volume", ticker.volume),
    ];
    for (name, value) in secondary {
        if value.is_none() {
            issues.push(ValidationIssue::warning(format!("ticker.{name}"), format!("{name} missing")));
        }
    }
    issues
}

/// Fails when `timestamp` is older than `max_age` or further than
/// `future_tolerance` ahead of `now`.
pub fn check_time_range(
    field: &str,
    timestamp: DateTime<Utc>,
    now: DateTime<Utc>,
    max_age: Duration,
    future_tolerance: Duration,
) -> Option<ValidationIssue> {
    let age = now - timestamp;
    if age > max_age {
        Some(ValidationIssue::violation(
            field,
            format!("data is {}s old (max {}s)", age.num_seconds(), max_age.num_seconds()),
        ))
    } else if -age > future_tolerance {
        Some(ValidationIssue::violation(
            field,
            format!(
                "timestamp {timestamp} is {}s in the future (tolerance {}s)",
                (-age).num_seconds(),
                future_tolerance.num_seconds()
            ),
        ))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).single().unwrap()
    }

    fn candle(secs: i64, open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle {
            timestamp: ts(secs),
            open,
            high,
            low,
            close,
            volume: 1.0,
        }
    }

    fn level(price: f64) -> OrderBookLevel {
        OrderBookLevel { price, size: 1.0 }
    }

    #[test]
    fn test_candle_bounds_rejected() {
        let good = vec![candle(0, 10.0, 12.0, 9.0, 11.0), candle(60, 11.0, 11.5, 10.0, 10.5)];
        assert!(check_candles("ohlcv.base", &good).is_empty());

        let high_below_close = vec![candle(0, 10.0, 10.5, 9.0, 11.0)];
        assert_eq!(check_candles("ohlcv.base", &high_below_close).len(), 1);

        let negative_volume = vec![Candle { volume: -1.0, ..candle(0, 10.0, 12.0, 9.0, 11.0) }];
        assert!(!check_candles("ohlcv.base", &negative_volume).is_empty());
    }

    #[test]
    fn test_candle_timestamps_must_increase() {
        let dup = vec![candle(0, 10.0, 12.0, 9.0, 11.0), candle(0, 10.0, 12.0, 9.0, 11.0)];
        let issues = check_candles("ohlcv.base", &dup);
        assert_eq!(issues.len(), 1);
        assert!(issues[0].message.contains("strictly increasing"));
    }

    #[test]
    fn test_orderbook_ordering_and_crossing() {
        let ok = OrderBook {
            bids: vec![level(100.0), level(99.0)],
            asks: vec![level(101.0), level(102.0)],
            timestamp: ts(0),
        };
        assert!(check_orderbook(&ok, 20).is_empty());

        let crossed = OrderBook {
            bids: vec![level(101.0)],
            asks: vec![level(100.0)],
            timestamp: ts(0),
        };
        assert!(check_orderbook(&crossed, 20).iter().any(|i| i.field == "orderbook" && i.is_violation()));

        let unordered = OrderBook {
            bids: vec![level(99.0), level(100.0)],
            asks: vec![level(101.0)],
            timestamp: ts(0),
        };
        assert!(check_orderbook(&unordered, 20).iter().any(|i| i.field == "orderbook.bids"));
    }

    #[test]
    fn test_orderbook_checks_only_prefix() {
        let mut asks: Vec<OrderBookLevel> = (0..20).map(|i| level(101.0 + i as f64)).collect();
        asks.push(level(50.0));
        let book = OrderBook {
            bids: vec![level(100.0)],
            asks,
            timestamp: ts(0),
        };
        assert!(check_orderbook(&book, 20).is_empty());
        assert!(!check_orderbook(&book, 21).is_empty());
    }

    #[test]
    fn test_trades_rules() {
        assert!(check_trades(&[]).is_empty());
        let aliased: Trade = serde_json::from_str(
            r#"{"price": 100.0, "amount": 0.5, "timestamp": "2024-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert!(check_trades(&[aliased.clone()]).is_empty());

        let no_size = Trade { size: None, ..aliased.clone() };
        let zero_price = Trade { price: 0.0, ..aliased };
        assert_eq!(check_trades(&[no_size, zero_price]).len(), 2);
    }

    #[test]
    fn test_ticker_rules() {
        let mut ticker = Ticker::new("BTCUSDT", ts(0));
        ticker.last = Some(100.0);
        let issues = check_ticker(&ticker);
        assert!(issues.iter().all(|i| !i.is_violation()));
        assert!(!issues.is_empty());

        ticker.bid = Some(-1.0);
        assert!(check_ticker(&ticker).iter().any(|i| i.field == "ticker.bid" && i.is_violation()));

        let empty = Ticker::new("BTCUSDT", ts(0));
        assert!(check_ticker(&empty).iter().any(|i| i.field == "ticker" && i.is_violation()));
    }

    #[test]
    fn test_time_range() {
        let now = ts(1_000);
        let max_age = Duration::seconds(60);
        let tolerance = Duration::seconds(5);
        assert!(check_time_range("t", ts(940), now, max_age, tolerance).is_none());
        assert!(check_time_range("t", ts(939), now, max_age, tolerance).is_some());
        assert!(check_time_range("t", ts(1_005), now, max_age, tolerance).is_none());
        let future = check_time_range("t", ts(1_006), now, max_age, tolerance).unwrap();
        assert!(future.message.contains("future"));
    }
}
