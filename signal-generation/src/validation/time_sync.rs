// Multi-timeframe synchronisation
// Checks that the latest data of every timeframe was observed at roughly the
// same moment.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use common::Candle;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

/// Field names looked up, in order, by [`FieldExtractor`].
pub const TIMESTAMP_FIELDS: [&str; 5] = ["timestamp", "time", "datetime", "ts", "date"];

/// Wrapper keys unwrapped by [`NestedExtractor`].
pub const WRAPPER_FIELDS: [&str; 2] = ["ohlcv", "data"];

/// Unix values above this are taken as milliseconds.
const MILLIS_THRESHOLD: f64 = 1e10;

const MAX_DEPTH: usize = 4;

/// Latest data for one timeframe, in whatever shape it arrived.
#[derive(Debug, Clone, PartialEq)]
pub enum TimeframeData {
    /// Time-indexed table
    Candles(Vec<Candle>),
    Json(Value),
}

impl From<Vec<Candle>> for TimeframeData {
    fn from(candles: Vec<Candle>) -> Self {
        TimeframeData::Candles(candles)
    }
}

impl From<Value> for TimeframeData {
    fn from(value: Value) -> Self {
        TimeframeData::Json(value)
    }
}

/// One strategy for pulling a representative timestamp out of timeframe
/// data. Strategies that recurse go back through the whole chain.
pub trait TimestampExtractor: Send + Sync {
    fn name(&self) -> &'static str;

    fn extract(&self, data: &TimeframeData, chain: &ExtractorChain, depth: usize) -> Option<DateTime<Utc>>;
}

/// Max index of a time-indexed table.
pub struct IndexExtractor;

impl TimestampExtractor for IndexExtractor {
    fn name(&self) -> &'static str {
        "index"
    }

    fn extract(&self, data: &TimeframeData, _chain: &ExtractorChain, _depth: usize) -> Option<DateTime<Utc>> {
        match data {
            TimeframeData::Candles(candles) => candles.iter().map(|c| c.timestamp).max(),
            TimeframeData::Json(_) => None,
        }
    }
}

/// A `timestamp|time|datetime|ts|date` field on an object.
pub struct FieldExtractor;

impl TimestampExtractor for FieldExtractor {
    fn name(&self) -> &'static str {
        "field"
    }

    fn extract(&self, data: &TimeframeData, _chain: &ExtractorChain, _depth: usize) -> Option<DateTime<Utc>> {
        let TimeframeData::Json(Value::Object(map)) = data else {
            return None;
        };
        TIMESTAMP_FIELDS
            .iter()
            .filter_map(|key| map.get(*key))
            .find_map(parse_timestamp)
    }
}

/// An `{ohlcv: ...}` or `{data: ...}` wrapper.
pub struct NestedExtractor;

impl TimestampExtractor for NestedExtractor {
    fn name(&self) -> &'static str {
        "nested"
    }

    fn extract(&self, data: &TimeframeData, chain: &ExtractorChain, depth: usize) -> Option<DateTime<Utc>> {
        let TimeframeData::Json(Value::Object(map)) = data else {
            return None;
        };
        WRAPPER_FIELDS
            .iter()
            .filter_map(|key| map.get(*key))
            .find_map(|inner| chain.extract_at(&TimeframeData::Json(inner.clone()), depth + 1))
    }
}

/// The last element of a list: an object, a kline row, or a bare timestamp.
pub struct LastElementExtractor;

impl TimestampExtractor for LastElementExtractor {
    fn name(&self) -> &'static str {
        "last_element"
    }

    fn extract(&self, data: &TimeframeData, chain: &ExtractorChain, depth: usize) -> Option<DateTime<Utc>> {
        let TimeframeData::Json(Value::Array(items)) = data else {
            return None;
        };
        match items.last()? {
            Value::Array(row) => row.first().and_then(parse_timestamp),
            scalar @ (Value::Number(_) | Value::String(_)) => parse_timestamp(scalar),
            other => chain.extract_at(&TimeframeData::Json(other.clone()), depth + 1),
        }
    }
}

/// Extractors tried in order; the first one that yields a timestamp wins.
pub struct ExtractorChain {
    extractors: Vec<Box<dyn TimestampExtractor>>,
}

impl Default for ExtractorChain {
    fn default() -> Self {
        Self::new(vec![
            Box::new(IndexExtractor),
            Box::new(FieldExtractor),
            Box::new(NestedExtractor),
            Box::new(LastElementExtractor),
        ])
    }
}

impl ExtractorChain {
    pub fn new(extractors: Vec<Box<dyn TimestampExtractor>>) -> Self {
        Self { extractors }
    }

    pub fn extract(&self, data: &TimeframeData) -> Option<DateTime<Utc>> {
        self.extract_at(data, 0)
    }

    fn extract_at(&self, data: &TimeframeData, depth: usize) -> Option<DateTime<Utc>> {
        if depth > MAX_DEPTH {
            return None;
        }
        self.extractors.iter().find_map(|e| {
            let found = e.extract(data, self, depth);
            if found.is_some() {
                debug!(extractor = e.name(), depth, "timestamp extracted");
            }
            found
        })
    }
}

/// Datetime string (RFC 3339, naive ISO-8601 or a date), or a unix
/// timestamp in seconds or milliseconds, as number or numeric string.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n.as_f64().and_then(from_unix),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
                if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
                    return Some(naive.and_utc());
                }
            }
            if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
                return date.and_hms_opt(0, 0, 0).map(|n| n.and_utc());
            }
            s.parse::<f64>().ok().and_then(from_unix)
        }
        _ => None,
    }
}

fn from_unix(raw: f64) -> Option<DateTime<Utc>> {
    if !raw.is_finite() {
        return None;
    }
    let millis = if raw > MILLIS_THRESHOLD { raw } else { raw * 1000.0 };
    DateTime::<Utc>::from_timestamp_millis(millis.round() as i64)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncStats {
    pub validation_count: u64,
    pub failure_count: u64,
    pub max_observed_delta: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncOutcome {
    pub passed: bool,
    /// `max - min` across the extracted timestamps, if at least two were found
    pub delta_seconds: Option<f64>,
    pub timestamps: BTreeMap<String, DateTime<Utc>>,
    pub reason: Option<String>,
}

pub struct TimeSyncValidator {
    max_delta_seconds: f64,
    chain: ExtractorChain,
    stats: Mutex<SyncStats>,
}

impl TimeSyncValidator {
    pub fn new(max_delta_seconds: f64) -> Self {
        Self::with_chain(max_delta_seconds, ExtractorChain::default())
    }

    pub fn with_chain(max_delta_seconds: f64, chain: ExtractorChain) -> Self {
        Self {
            max_delta_seconds,
            chain,
            stats: Mutex::new(SyncStats::default()),
        }
    }

    pub fn max_delta_seconds(&self) -> f64 {
        self.max_delta_seconds
    }

    pub fn stats(&self) -> SyncStats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn check(&self, timeframes: &BTreeMap<String, TimeframeData>) -> SyncOutcome {
        let timestamps: BTreeMap<String, DateTime<Utc>> = timeframes
            .iter()
            .filter_map(|(name, data)| {
                let ts = self.chain.extract(data);
                if ts.is_none() {
                    debug!(timeframe = %name, "no timestamp found");
                }
                ts.map(|t| (name.clone(), t))
            })
            .collect();

        let bounds = timestamps
            .values()
            .min()
            .zip(timestamps.values().max())
            .filter(|_| timestamps.len() >= 2);

        let Some((min, max)) = bounds else {
            self.record(None, true);
            return SyncOutcome {
                passed: true,
                delta_seconds: None,
                timestamps,
                reason: None,
            };
        };

        let span = *max - *min;
        let delta = span
            .num_microseconds()
            .map(|us| us as f64 / 1e6)
            .unwrap_or_else(|| span.num_milliseconds() as f64 / 1e3);
        let passed = delta <= self.max_delta_seconds;

        let reason = (!passed).then(|| {
            let mut ordered: Vec<(&String, &DateTime<Utc>)> = timestamps.iter().collect();
            ordered.sort_by_key(|(_, ts)| **ts);
            let pairs: Vec<String> = ordered
                .iter()
                .map(|(name, ts)| format!("{name}={}", ts.to_rfc3339()))
                .collect();
            format!(
                "timeframes out of sync by {delta:.3}s (max {}s): {}",
                self.max_delta_seconds,
                pairs.join(", ")
            )
        });
        if let Some(reason) = &reason {
            warn!(delta, max_delta = self.max_delta_seconds, "{reason}");
        }

        self.record(Some(delta), passed);
        SyncOutcome {
            passed,
            delta_seconds: Some(delta),
            timestamps,
            reason,
        }
    }

    fn record(&self, delta: Option<f64>, passed: bool) {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        stats.validation_count += 1;
        if !passed {
            stats.failure_count += 1;
        }
        if let Some(delta) = delta {
            stats.max_observed_delta = stats.max_observed_delta.max(delta);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    const T: i64 = 1_708_627_200;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(T + secs, 0).single().unwrap()
    }

    fn series_ending(end: DateTime<Utc>) -> TimeframeData {
        let candle = |ts| Candle {
            timestamp: ts,
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            volume: 1.0,
        };
        TimeframeData::Candles(vec![candle(end - Duration::seconds(60)), candle(end)])
    }

    #[test]
    fn test_exact_max_delta_passes() {
        let validator = TimeSyncValidator::new(60.0);
        let mut data = BTreeMap::new();
        data.insert("base".to_string(), series_ending(at(0)));
        data.insert("htf".to_string(), series_ending(at(-60)));

        let outcome = validator.check(&data);
        assert!(outcome.passed);
        assert_eq!(outcome.delta_seconds, Some(60.0));
    }

    #[test]
    fn test_just_over_max_delta_fails() {
        let validator = TimeSyncValidator::new(60.0);
        let mut data = BTreeMap::new();
        data.insert("base".to_string(), series_ending(at(0)));
        data.insert(
            "htf".to_string(),
            series_ending(at(-60) - Duration::milliseconds(1)),
        );

        let outcome = validator.check(&data);
        assert!(!outcome.passed);
        assert!((outcome.delta_seconds.unwrap() - 60.001).abs() < 1e-9);
    }

    #[test]
    fn test_htf_lagging_300s_reports_delta() {
        let validator = TimeSyncValidator::new(60.0);
        let mut data = BTreeMap::new();
        data.insert("base".to_string(), series_ending(at(0)));
        data.insert("ltf".to_string(), series_ending(at(-30)));
        data.insert("htf".to_string(), series_ending(at(-300)));

        let outcome = validator.check(&data);
        assert!(!outcome.passed);
        let reason = outcome.reason.unwrap();
        assert!(reason.contains("300.000s"), "{reason}");
        assert!(reason.contains("htf="));
        assert!(reason.contains("base="));

        let stats = validator.stats();
        assert_eq!(stats.validation_count, 1);
        assert_eq!(stats.failure_count, 1);
        assert_eq!(stats.max_observed_delta, 300.0);
    }

    #[test]
    fn test_fewer_than_two_timestamps_pass() {
        let validator = TimeSyncValidator::new(60.0);
        let mut data = BTreeMap::new();
        data.insert("base".to_string(), series_ending(at(0)));
        data.insert("junk".to_string(), TimeframeData::Json(json!({"close": 1.0})));

        let outcome = validator.check(&data);
        assert!(outcome.passed);
        assert_eq!(outcome.delta_seconds, None);
        assert_eq!(validator.stats().validation_count, 1);
    }

    #[test]
    fn test_extractor_shapes() {
        let chain = ExtractorChain::default();
        let expected = at(0);

        let shapes = [
            json!({"timestamp": T}),
            json!({"ts": T * 1000}),
            json!({"datetime": "2024-02-22T18:40:00Z"}),
            json!({"time": "2024-02-22T18:40:00"}),
            json!({"ohlcv": [[T * 1000 - 60_000, 1, 1, 1, 1, 1], [T * 1000, 1, 1, 1, 1, 1]]}),
            json!({"data": {"date": T.to_string()}}),
            json!([{"timestamp": T - 60}, {"timestamp": T}]),
            json!([T - 60, T]),
        ];
        for shape in shapes {
            assert_eq!(
                chain.extract(&TimeframeData::Json(shape.clone())),
                Some(expected),
                "{shape}"
            );
        }
        assert_eq!(
            chain.extract(&TimeframeData::Json(json!({"date": "2024-02-22"}))),
            Some(Utc.with_ymd_and_hms(2024, 2, 22, 0, 0, 0).unwrap())
        );
        assert_eq!(chain.extract(&TimeframeData::Json(json!({"close": 1.0}))), None);
    }

    #[test]
    fn test_field_precedes_wrapper() {
        let chain = ExtractorChain::default();
        let data = json!({"timestamp": T, "data": {"timestamp": T - 500}});
        assert_eq!(chain.extract(&TimeframeData::Json(data)), Some(at(0)));
    }

    #[test]
    fn test_recursion_is_bounded() {
        let mut value = json!({"timestamp": T});
        for _ in 0..10 {
            value = json!({ "data": value });
        }
        assert_eq!(ExtractorChain::default().extract(&TimeframeData::Json(value)), None);
    }
}
