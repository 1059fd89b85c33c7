// Market Data Validation
// Structural and temporal checks on collected snapshots before scoring

pub mod rules;
pub mod time_sync;

pub use rules::{Severity, ValidationIssue};
pub use time_sync::{
    ExtractorChain, SyncOutcome, SyncStats, TimeSyncValidator, TimeframeData, TimestampExtractor,
};

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use common::MarketSnapshot;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationMode {
    /// Any violation fails the snapshot
    Strict,
    /// Violations only lower the quality score
    #[default]
    Lenient,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    #[serde(default)]
    pub mode: ValidationMode,
    /// Oldest acceptable ticker/orderbook timestamp
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: i64,
    #[serde(default = "default_future_tolerance_secs")]
    pub future_tolerance_secs: i64,
    #[serde(default = "default_orderbook_levels")]
    pub orderbook_levels: usize,
    #[serde(default = "default_max_sync_delta_secs")]
    pub max_sync_delta_secs: f64,
    /// Lenient mode still rejects snapshots scoring below this
    #[serde(default)]
    pub min_quality: f64,
}

fn default_max_age_secs() -> i64 {
    120
}

fn default_future_tolerance_secs() -> i64 {
    5
}

fn default_orderbook_levels() -> usize {
    20
}

fn default_max_sync_delta_secs() -> f64 {
    60.0
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            mode: ValidationMode::default(),
            max_age_secs: default_max_age_secs(),
            future_tolerance_secs: default_future_tolerance_secs(),
            orderbook_levels: default_orderbook_levels(),
            max_sync_delta_secs: default_max_sync_delta_secs(),
            min_quality: 0.0,
        }
    }
}

const VIOLATION_PENALTY: f64 = 15.0;
const WARNING_PENALTY: f64 = 3.0;
const MISSING_FIELD_PENALTY: f64 = 5.0;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    /// 0-100
    pub quality_score: f64,
    pub issues: Vec<ValidationIssue>,
    pub sync: Option<SyncOutcome>,
}

impl ValidationReport {
    pub fn violations(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(|i| i.is_violation())
    }
}

/// Something that can judge a snapshot before it is scored.
pub trait DataValidator: Send + Sync {
    fn validate(&self, snapshot: &MarketSnapshot) -> ValidationReport;
}

pub struct SnapshotValidator {
    config: ValidationConfig,
    time_sync: TimeSyncValidator,
}

impl SnapshotValidator {
    pub fn new(config: ValidationConfig) -> Self {
        let time_sync = TimeSyncValidator::new(config.max_sync_delta_secs);
        Self { config, time_sync }
    }

    pub fn config(&self) -> &ValidationConfig {
        &self.config
    }

    pub fn sync_stats(&self) -> SyncStats {
        self.time_sync.stats()
    }

    pub fn validate_at(&self, snapshot: &MarketSnapshot, now: DateTime<Utc>) -> ValidationReport {
        let mut issues = Vec::new();
        let max_age = Duration::seconds(self.config.max_age_secs);
        let tolerance = Duration::seconds(self.config.future_tolerance_secs);

        if let Some(ticker) = &snapshot.ticker {
            issues.extend(rules::check_ticker(ticker));
            issues.extend(rules::check_time_range("ticker.timestamp", ticker.timestamp, now, max_age, tolerance));
        }
        if let Some(book) = &snapshot.orderbook {
            issues.extend(rules::check_orderbook(book, self.config.orderbook_levels));
            issues.extend(rules::check_time_range("orderbook.timestamp", book.timestamp, now, max_age, tolerance));
        }
        if let Some(trades) = &snapshot.trades {
            issues.extend(rules::check_trades(trades));
        }
        for (name, candles) in &snapshot.ohlcv {
            issues.extend(rules::check_candles(&format!("ohlcv.{name}"), candles));
        }

        let timeframes: BTreeMap<String, TimeframeData> = snapshot
            .ohlcv
            .iter()
            .map(|(name, candles)| (name.clone(), TimeframeData::Candles(candles.clone())))
            .collect();
        let sync = self.time_sync.check(&timeframes);
        if let Some(reason) = &sync.reason {
            issues.push(ValidationIssue::violation("ohlcv", reason.clone()));
        }

        let violations = issues.iter().filter(|i| i.is_violation()).count() as f64;
        let warnings = issues.len() as f64 - violations;
        let missing = snapshot.missing_fields.len() as f64;
        let quality_score = (100.0
            - violations * VIOLATION_PENALTY
            - warnings * WARNING_PENALTY
            - missing * MISSING_FIELD_PENALTY)
            .clamp(0.0, 100.0);

        let valid = match self.config.mode {
            ValidationMode::Strict => violations == 0.0,
            ValidationMode::Lenient => quality_score >= self.config.min_quality,
        };

        debug!(
            symbol = %snapshot.symbol,
            valid,
            quality_score,
            violations,
            warnings,
            "snapshot validated"
        );

        ValidationReport {
            valid,
            quality_score,
            issues,
            sync: Some(sync),
        }
    }
}

impl DataValidator for SnapshotValidator {
    fn validate(&self, snapshot: &MarketSnapshot) -> ValidationReport {
        self.validate_at(snapshot, Utc::now())
    }
}
