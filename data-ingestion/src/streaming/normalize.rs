//! Exchange payload → canonical shapes.
//!
//! Field names differ between venues and between REST and stream payloads,
//! so every lookup goes through a short alias list. Numbers may arrive as
//! JSON numbers or as strings.

use chrono::{DateTime, Utc};
use common::{canonical_interval, Candle, DataKind, Liquidation, Ticker, Trade, TradeSide};
use serde_json::Value;

/// Level updates for one book side: `(price, size)`, size 0 meaning delete.
pub type LevelUpdates = Vec<(f64, f64)>;

#[derive(Debug, Clone, PartialEq)]
pub struct BookUpdate {
    pub bids: LevelUpdates,
    pub asks: LevelUpdates,
    pub is_snapshot: bool,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Splits `kline.60.BTCUSDT` into its kind and optional parameter (`60`).
pub fn classify_topic(topic: &str) -> Option<(DataKind, Option<String>)> {
    let mut parts = topic.split('.');
    let channel = parts.next()?;
    let kind = match channel {
        "tickers" | "ticker" => DataKind::Ticker,
        "kline" | "candle" => DataKind::Kline,
        "orderbook" | "depth" | "books" => DataKind::OrderBook,
        "publicTrade" | "trade" | "trades" => DataKind::Trades,
        "allLiquidation" | "liquidation" | "forceOrder" => DataKind::Liquidations,
        _ => return None,
    };
    let rest: Vec<&str> = parts.collect();
    // last segment is the symbol; anything between is the channel parameter
    let param = if rest.len() >= 2 {
        Some(rest[..rest.len() - 1].join("."))
    } else {
        None
    };
    Some((kind, param))
}

/// Stream interval token (`"1"`, `"60"`, `"D"`, `"1h"`) to canonical form.
pub fn normalize_interval(token: &str) -> String {
    match token {
        "D" | "1D" => "1d".to_string(),
        "W" | "1W" => "1w".to_string(),
        "M" | "1M" => "1M".to_string(),
        t => match t.parse::<u32>() {
            Ok(minutes) => canonical_interval(minutes),
            Err(_) => t.to_string(),
        },
    }
}

/// The frame's `data` member if present, else the frame itself.
pub fn payload_data(payload: &Value) -> &Value {
    payload.get("data").unwrap_or(payload)
}

fn field<'a>(obj: &'a Value, aliases: &[&str]) -> Option<&'a Value> {
    aliases.iter().find_map(|k| obj.get(*k).filter(|v| !v.is_null()))
}

pub fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) if !s.is_empty() => s.parse().ok(),
        _ => None,
    }
}

fn num(obj: &Value, aliases: &[&str]) -> Option<f64> {
    field(obj, aliases).and_then(as_f64)
}

fn millis(obj: &Value, aliases: &[&str]) -> Option<DateTime<Utc>> {
    let ms = num(obj, aliases)?;
    DateTime::<Utc>::from_timestamp_millis(ms as i64)
}

/// Merges a ticker payload onto the previous ticker. Delta frames only carry
/// the fields that changed, so anything absent keeps its old value.
pub fn normalize_ticker(
    symbol: &str,
    payload: &Value,
    previous: Option<&Ticker>,
    received_at: DateTime<Utc>,
) -> Option<Ticker> {
    let data = payload_data(payload);
    if !data.is_object() {
        return None;
    }

    let mut ticker = previous
        .cloned()
        .unwrap_or_else(|| Ticker::new(symbol, received_at));
    ticker.timestamp = millis(payload, &["ts"]).unwrap_or(received_at);

    let set = |slot: &mut Option<f64>, aliases: &[&str]| {
        if let Some(v) = num(data, aliases) {
            *slot = Some(v);
        }
    };
    set(&mut ticker.last, &["lastPrice", "last", "c", "price"]);
    set(&mut ticker.bid, &["bid1Price", "bidPrice", "bid", "b"]);
    set(&mut ticker.ask, &["ask1Price", "askPrice", "ask", "a"]);
    set(&mut ticker.open, &["prevPrice24h", "openPrice", "open", "o"]);
    set(&mut ticker.high, &["highPrice24h", "highPrice", "high", "h"]);
    set(&mut ticker.low, &["lowPrice24h", "lowPrice", "low", "l"]);
    set(&mut ticker.volume, &["volume24h", "volume", "v"]);
    set(&mut ticker.quote_volume, &["turnover24h", "quoteVolume", "q"]);
    set(&mut ticker.mark_price, &["markPrice", "mark"]);
    set(&mut ticker.index_price, &["indexPrice", "index"]);
    set(&mut ticker.funding_rate, &["fundingRate", "funding"]);
    set(&mut ticker.open_interest, &["openInterest", "oi"]);

    if let Some(frac) = num(data, &["price24hPcnt"]) {
        ticker.change_pct = Some(frac * 100.0);
    } else if let Some(pct) = num(data, &["priceChangePercent", "P"]) {
        ticker.change_pct = Some(pct);
    }

    Some(ticker)
}

fn candle_from(value: &Value) -> Option<Candle> {
    if let Some(row) = value.as_array() {
        let get = |i: usize| row.get(i).and_then(as_f64);
        return Some(Candle {
            timestamp: DateTime::<Utc>::from_timestamp_millis(get(0)? as i64)?,
            open: get(1)?,
            high: get(2)?,
            low: get(3)?,
            close: get(4)?,
            volume: get(5).unwrap_or(0.0),
        });
    }
    let obj = value.get("k").unwrap_or(value);
    Some(Candle {
        timestamp: millis(obj, &["start", "t", "openTime", "timestamp"])?,
        open: num(obj, &["open", "o"])?,
        high: num(obj, &["high", "h"])?,
        low: num(obj, &["low", "l"])?,
        close: num(obj, &["close", "c"])?,
        volume: num(obj, &["volume", "v"]).unwrap_or(0.0),
    })
}

/// Candles in the payload, oldest first.
pub fn normalize_klines(payload: &Value) -> Vec<Candle> {
    let data = payload_data(payload);
    let mut candles: Vec<Candle> = match data {
        Value::Array(items) if items.first().map_or(false, Value::is_array) => {
            items.iter().filter_map(candle_from).collect()
        }
        Value::Array(items) => items.iter().filter_map(candle_from).collect(),
        other => candle_from(other).into_iter().collect(),
    };
    candles.sort_by_key(|c| c.timestamp);
    candles
}

fn levels(value: Option<&Value>) -> LevelUpdates {
    let Some(Value::Array(items)) = value else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|lvl| match lvl {
            Value::Array(pair) => Some((as_f64(pair.first()?)?, as_f64(pair.get(1)?)?)),
            obj @ Value::Object(_) => Some((
                num(obj, &["price", "p"])?,
                num(obj, &["size", "qty", "amount", "s"])?,
            )),
            _ => None,
        })
        .collect()
}

pub fn normalize_orderbook(payload: &Value) -> Option<BookUpdate> {
    let data = payload_data(payload);
    if !data.is_object() {
        return None;
    }
    let is_snapshot = payload
        .get("type")
        .and_then(Value::as_str)
        .map_or(true, |t| t.eq_ignore_ascii_case("snapshot"));
    Some(BookUpdate {
        bids: levels(field(data, &["b", "bids"])),
        asks: levels(field(data, &["a", "asks"])),
        is_snapshot,
        timestamp: millis(payload, &["ts", "cts"]).or_else(|| millis(data, &["ts", "T", "E"])),
    })
}

fn as_array(data: &Value) -> Vec<&Value> {
    match data {
        Value::Array(items) => items.iter().collect(),
        other if other.is_object() => vec![other],
        _ => Vec::new(),
    }
}

pub fn normalize_trades(payload: &Value, received_at: DateTime<Utc>) -> Vec<Trade> {
    as_array(payload_data(payload))
        .into_iter()
        .filter_map(|t| {
            Some(Trade {
                id: field(t, &["i", "id", "tradeId", "execId"]).map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                }),
                price: num(t, &["p", "price"])?,
                size: num(t, &["v", "size", "qty", "quantity", "amount", "q"]),
                side: field(t, &["S", "side", "m"]).and_then(|v| match v {
                    Value::String(s) => TradeSide::parse(s),
                    // binance "is buyer maker": the aggressor sold
                    Value::Bool(true) => Some(TradeSide::Sell),
                    Value::Bool(false) => Some(TradeSide::Buy),
                    _ => None,
                }),
                timestamp: millis(t, &["T", "time", "timestamp"]).unwrap_or(received_at),
            })
        })
        .collect()
}

pub fn normalize_liquidations(symbol: &str, payload: &Value, received_at: DateTime<Utc>) -> Vec<Liquidation> {
    as_array(payload_data(payload))
        .into_iter()
        .filter_map(|l| {
            let l = l.get("o").unwrap_or(l);
            Some(Liquidation {
                symbol: field(l, &["s", "symbol"])
                    .and_then(Value::as_str)
                    .unwrap_or(symbol)
                    .to_string(),
                side: field(l, &["S", "side"])
                    .and_then(Value::as_str)
                    .and_then(TradeSide::parse),
                price: num(l, &["p", "price", "ap"])?,
                size: num(l, &["v", "size", "q", "qty"])?,
                timestamp: millis(l, &["T", "updatedTime", "time"]).unwrap_or(received_at),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classify_topics() {
        assert_eq!(classify_topic("tickers.BTCUSDT"), Some((DataKind::Ticker, None)));
        assert_eq!(
            classify_topic("kline.60.BTCUSDT"),
            Some((DataKind::Kline, Some("60".to_string())))
        );
        assert_eq!(
            classify_topic("orderbook.50.BTCUSDT"),
            Some((DataKind::OrderBook, Some("50".to_string())))
        );
        assert_eq!(classify_topic("publicTrade.ETHUSDT"), Some((DataKind::Trades, None)));
        assert_eq!(classify_topic("allLiquidation.ETHUSDT"), Some((DataKind::Liquidations, None)));
        assert_eq!(classify_topic("insurance.USDT"), None);
    }

    #[test]
    fn test_interval_tokens() {
        assert_eq!(normalize_interval("1"), "1m");
        assert_eq!(normalize_interval("60"), "1h");
        assert_eq!(normalize_interval("240"), "4h");
        assert_eq!(normalize_interval("D"), "1d");
        assert_eq!(normalize_interval("15m"), "15m");
    }

    #[test]
    fn test_ticker_delta_keeps_previous_fields() {
        let now = Utc::now();
        let snapshot = json!({"ts": 1708627200000i64, "data": {"symbol": "BTCUSDT", "lastPrice": "64000", "bid1Price": "63999", "price24hPcnt": "0.01"}});
        let first = normalize_ticker("BTCUSDT", &snapshot, None, now).unwrap();
        assert_eq!(first.last, Some(64000.0));
        assert_eq!(first.change_pct, Some(1.0));

        let delta = json!({"data": {"lastPrice": "64010.5"}});
        let second = normalize_ticker("BTCUSDT", &delta, Some(&first), now).unwrap();
        assert_eq!(second.last, Some(64010.5));
        assert_eq!(second.bid, Some(63999.0));
    }

    #[test]
    fn test_bybit_kline_payload() {
        let payload = json!({
            "topic": "kline.5.BTCUSDT",
            "data": [{
                "start": 1708627200000i64, "end": 1708627499999i64, "interval": "5",
                "open": "100", "close": "101", "high": "102", "low": "99",
                "volume": "12.5", "turnover": "1250", "confirm": false
            }]
        });
        let candles = normalize_klines(&payload);
        assert_eq!(candles.len(), 1);
        assert_eq!(candles[0].high, 102.0);
        assert_eq!(candles[0].volume, 12.5);
    }

    #[test]
    fn test_array_kline_rows() {
        let payload = json!([[1708627260000i64, "2", "3", "1", "2.5", "7"], [1708627200000i64, "1", "2", "0.5", "1.5", "4"]]);
        let candles = normalize_klines(&payload);
        assert_eq!(candles.len(), 2);
        assert!(candles[0].timestamp < candles[1].timestamp);
    }

    #[test]
    fn test_orderbook_delta_flag() {
        let payload = json!({"type": "delta", "ts": 1708627200000i64, "data": {"s": "BTCUSDT", "b": [["100.5", "0"]], "a": [["101", "2.5"]]}});
        let update = normalize_orderbook(&payload).unwrap();
        assert!(!update.is_snapshot);
        assert_eq!(update.bids, vec![(100.5, 0.0)]);
        assert_eq!(update.asks, vec![(101.0, 2.5)]);
    }

    #[test]
    fn test_trades_with_aliases() {
        let now = Utc::now();
        let payload = json!({"data": [
            {"T": 1708627200000i64, "s": "BTCUSDT", "S": "Buy", "v": "0.01", "p": "64000", "i": "abc"},
            {"time": 1708627200100i64, "side": "sell", "qty": 2, "price": 64001},
            {"T": 1708627200200i64, "S": "Buy", "v": "1"}
        ]});
        let trades = normalize_trades(&payload, now);
        assert_eq!(trades.len(), 2);
        assert_eq!(trades[0].side, Some(TradeSide::Buy));
        assert_eq!(trades[1].size, Some(2.0));
    }

    #[test]
    fn test_liquidations() {
        let now = Utc::now();
        let payload = json!({"data": [{"T": 1708627200000i64, "s": "BTCUSDT", "S": "Sell", "v": "0.5", "p": "63000"}]});
        let liqs = normalize_liquidations("BTCUSDT", &payload, now);
        assert_eq!(liqs.len(), 1);
        assert_eq!(liqs[0].size, 0.5);
        assert_eq!(liqs[0].side, Some(TradeSide::Sell));
    }
}
