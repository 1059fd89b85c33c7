use serde::{Deserialize, Serialize};

/// A configured timeframe: either already canonical (`"1h"`) or given as
/// `{ interval_minutes = 60 }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TimeframeSpec {
    Named(String),
    Minutes { interval_minutes: u32 },
}

impl TimeframeSpec {
    pub fn canonical(&self) -> String {
        match self {
            TimeframeSpec::Named(name) => name.clone(),
            TimeframeSpec::Minutes { interval_minutes } => canonical_interval(*interval_minutes),
        }
    }
}

impl From<&str> for TimeframeSpec {
    fn from(value: &str) -> Self {
        TimeframeSpec::Named(value.to_string())
    }
}

/// Minutes to the canonical interval string; unmapped values render as `"{n}m"`.
pub fn canonical_interval(minutes: u32) -> String {
    match minutes {
        1 => "1m".to_string(),
        5 => "5m".to_string(),
        15 => "15m".to_string(),
        30 => "30m".to_string(),
        60 => "1h".to_string(),
        240 => "4h".to_string(),
        n => format!("{n}m"),
    }
}

/// Length of a canonical interval (`"15m"`, `"4h"`, `"1d"`, `"1w"`) in seconds.
pub fn interval_seconds(interval: &str) -> Option<i64> {
    let interval = interval.trim();
    if interval.len() < 2 {
        return None;
    }
    let (count, unit) = interval.split_at(interval.len() - 1);
    let count: i64 = count.parse().ok()?;
    let unit_secs = match unit {
        "m" => 60,
        "h" => 3_600,
        "d" => 86_400,
        "w" => 604_800,
        _ => return None,
    };
    Some(count * unit_secs)
}
