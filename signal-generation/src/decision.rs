// Signal Decision Engine
// Maps a confluence score onto LONG / SHORT / NEUTRAL

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use common::{ConfluenceResult, SignalDecision, SignalType, Symbol};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::trade_params::{compute_or_default, TradeParamCalculator};

/// Decision thresholds on the 0-100 score scale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    #[serde(default = "default_long", alias = "long")]
    pub long_threshold: f64,
    #[serde(default = "default_short", alias = "short")]
    pub short_threshold: f64,
    #[serde(default = "default_buffer")]
    pub neutral_buffer: f64,
}

fn default_long() -> f64 {
    70.0
}

fn default_short() -> f64 {
    35.0
}

fn default_buffer() -> f64 {
    5.0
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            long_threshold: default_long(),
            short_threshold: default_short(),
            neutral_buffer: default_buffer(),
        }
    }
}

impl Thresholds {
    pub fn new(long_threshold: f64, short_threshold: f64, neutral_buffer: f64) -> Self {
        Self {
            long_threshold,
            short_threshold,
            neutral_buffer,
        }
    }

    pub fn check(&self) -> Result<(), String> {
        let values = [self.long_threshold, self.short_threshold, self.neutral_buffer];
        if values.iter().any(|v| !v.is_finite()) {
            return Err(format!("non-finite threshold in {self:?}"));
        }
        if self.long_threshold <= self.short_threshold {
            return Err(format!(
                "long threshold {} must be above short threshold {}",
                self.long_threshold, self.short_threshold
            ));
        }
        Ok(())
    }
}

/// Where a score sits relative to the thresholds. The buffer zones are
/// descriptive only; they never change the decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Zone {
    Long,
    /// `[L - B, L)`
    NearLong,
    /// `(S + B, L - B)`
    Neutral,
    /// `(S, S + B]`
    NearShort,
    Short,
}

impl Zone {
    pub fn classify(score: f64, t: &Thresholds) -> Self {
        if score >= t.long_threshold {
            Zone::Long
        } else if score <= t.short_threshold {
            Zone::Short
        } else if score >= t.long_threshold - t.neutral_buffer {
            Zone::NearLong
        } else if score <= t.short_threshold + t.neutral_buffer {
            Zone::NearShort
        } else {
            Zone::Neutral
        }
    }

    pub fn signal_type(self) -> SignalType {
        match self {
            Zone::Long => SignalType::Long,
            Zone::Short => SignalType::Short,
            Zone::NearLong | Zone::Neutral | Zone::NearShort => SignalType::Neutral,
        }
    }
}

impl fmt::Display for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Zone::Long => "long",
            Zone::NearLong => "neutral (near long)",
            Zone::Neutral => "neutral",
            Zone::NearShort => "neutral (near short)",
            Zone::Short => "short",
        };
        f.write_str(s)
    }
}

fn inputs_ok(score: f64, reliability: f64, thresholds: &Thresholds) -> bool {
    if let Err(reason) = thresholds.check() {
        error!(%reason, "invalid decision thresholds, forcing NEUTRAL");
        return false;
    }
    if !score.is_finite() || !reliability.is_finite() {
        error!(score, reliability, "non-numeric score input, forcing NEUTRAL");
        return false;
    }
    true
}

/// Stateless decision: recomputed from the raw score every time.
pub fn decide(score: f64, reliability: f64, thresholds: &Thresholds) -> SignalDecision {
    if !inputs_ok(score, reliability, thresholds) {
        return SignalDecision::neutral(score, reliability);
    }
    let zone = Zone::classify(score, thresholds);
    debug!(score, reliability, %zone, "score classified");
    SignalDecision {
        signal_type: zone.signal_type(),
        score,
        reliability,
        trade_params: None,
        decided_at: Utc::now(),
    }
}

/// Remembers the last directional decision per symbol. A LONG stays LONG
/// until the score reaches the short threshold, and vice versa.
#[derive(Debug, Default)]
pub struct StatefulHysteresis {
    previous: Mutex<HashMap<Symbol, SignalType>>,
}

impl StatefulHysteresis {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn previous(&self, symbol: &str) -> Option<SignalType> {
        self.previous
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(symbol)
            .copied()
    }

    pub fn reset(&self, symbol: &str) {
        self.previous
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(symbol);
    }

    pub fn decide(&self, symbol: &str, score: f64, reliability: f64, thresholds: &Thresholds) -> SignalDecision {
        if !inputs_ok(score, reliability, thresholds) {
            return SignalDecision::neutral(score, reliability);
        }

        let mut previous = self.previous.lock().unwrap_or_else(PoisonError::into_inner);
        let prior = previous.get(symbol).copied();
        let signal_type = match prior {
            Some(SignalType::Long) if score <= thresholds.short_threshold => SignalType::Short,
            Some(SignalType::Long) => SignalType::Long,
            Some(SignalType::Short) if score >= thresholds.long_threshold => SignalType::Long,
            Some(SignalType::Short) => SignalType::Short,
            Some(SignalType::Neutral) | None => Zone::classify(score, thresholds).signal_type(),
        };
        previous.insert(symbol.to_string(), signal_type);
        drop(previous);

        if prior.is_some_and(|p| p != signal_type) {
            info!(symbol, ?prior, new = %signal_type, score, "hysteresis switched direction");
        }
        SignalDecision {
            signal_type,
            score,
            reliability,
            trade_params: None,
            decided_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HysteresisMode {
    #[default]
    Stateless,
    Stateful,
}

/// Thresholds plus trade-parameter calculation for directional decisions.
pub struct DecisionEngine {
    thresholds: Thresholds,
    hysteresis: Option<StatefulHysteresis>,
    params: Arc<dyn TradeParamCalculator>,
}

impl DecisionEngine {
    pub fn new(thresholds: Thresholds, params: Arc<dyn TradeParamCalculator>) -> Self {
        Self {
            thresholds,
            hysteresis: None,
            params,
        }
    }

    pub fn with_hysteresis(mut self, mode: HysteresisMode) -> Self {
        self.hysteresis = match mode {
            HysteresisMode::Stateless => None,
            HysteresisMode::Stateful => Some(StatefulHysteresis::new()),
        };
        self
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    /// Decision for `symbol`, with trade parameters attached to LONG/SHORT
    /// when an entry price is known.
    pub fn evaluate(&self, symbol: &str, result: &ConfluenceResult, entry_price: Option<f64>) -> SignalDecision {
        let mut decision = match &self.hysteresis {
            Some(h) => h.decide(symbol, result.score, result.reliability, &self.thresholds),
            None => decide(result.score, result.reliability, &self.thresholds),
        };

        if decision.signal_type.is_directional() {
            decision.trade_params = entry_price.map(|entry| {
                compute_or_default(
                    self.params.as_ref(),
                    decision.signal_type,
                    entry,
                    decision.score,
                    decision.reliability,
                )
            });
            if decision.trade_params.is_none() {
                debug!(symbol, "no entry price, decision carries no trade parameters");
            }
        }
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t() -> Thresholds {
        Thresholds::new(70.0, 35.0, 5.0)
    }

    #[test]
    fn test_threshold_boundaries() {
        assert_eq!(decide(70.0, 50.0, &t()).signal_type, SignalType::Long);
        assert_eq!(decide(69.99, 50.0, &t()).signal_type, SignalType::Neutral);
        assert_eq!(decide(35.0, 50.0, &t()).signal_type, SignalType::Short);
        assert_eq!(decide(35.01, 50.0, &t()).signal_type, SignalType::Neutral);
    }

    #[test]
    fn test_zones() {
        assert_eq!(Zone::classify(65.0, &t()), Zone::NearLong);
        assert_eq!(Zone::classify(64.99, &t()), Zone::Neutral);
        assert_eq!(Zone::classify(40.0, &t()), Zone::NearShort);
        assert_eq!(Zone::classify(40.01, &t()), Zone::Neutral);
        assert_eq!(Zone::classify(100.0, &t()), Zone::Long);
        assert_eq!(Zone::classify(0.0, &t()), Zone::Short);
    }

    #[test]
    fn test_stateless_has_no_memory() {
        let thresholds = t();
        assert_eq!(decide(75.0, 50.0, &thresholds).signal_type, SignalType::Long);
        assert_eq!(decide(68.0, 50.0, &thresholds).signal_type, SignalType::Neutral);
        assert_eq!(decide(71.0, 50.0, &thresholds).signal_type, SignalType::Long);
    }

    #[test]
    fn test_invalid_thresholds_force_neutral() {
        let inverted = Thresholds::new(30.0, 60.0, 5.0);
        assert_eq!(decide(90.0, 80.0, &inverted).signal_type, SignalType::Neutral);
        assert_eq!(decide(10.0, 80.0, &inverted).signal_type, SignalType::Neutral);

        let equal = Thresholds::new(50.0, 50.0, 5.0);
        assert_eq!(decide(50.0, 80.0, &equal).signal_type, SignalType::Neutral);

        assert_eq!(decide(f64::NAN, 80.0, &t()).signal_type, SignalType::Neutral);
        assert_eq!(decide(90.0, f64::INFINITY, &t()).signal_type, SignalType::Neutral);
    }

    #[test]
    fn test_stateful_holds_until_opposite_threshold() {
        let h = StatefulHysteresis::new();
        let thresholds = t();
        let path = [
            (50.0, SignalType::Neutral),
            (72.0, SignalType::Long),
            (68.0, SignalType::Long),
            (50.0, SignalType::Long),
            (35.01, SignalType::Long),
            (35.0, SignalType::Short),
            (60.0, SignalType::Short),
            (69.99, SignalType::Short),
            (70.0, SignalType::Long),
        ];
        for (score, expected) in path {
            assert_eq!(h.decide("BTCUSDT", score, 50.0, &thresholds).signal_type, expected, "score {score}");
        }
        assert_eq!(h.previous("BTCUSDT"), Some(SignalType::Long));
        assert_eq!(h.previous("ETHUSDT"), None);
    }

    #[test]
    fn test_stateful_tracks_symbols_independently() {
        let h = StatefulHysteresis::new();
        let thresholds = t();
        h.decide("BTCUSDT", 80.0, 50.0, &thresholds);
        assert_eq!(h.decide("ETHUSDT", 50.0, 50.0, &thresholds).signal_type, SignalType::Neutral);
        assert_eq!(h.decide("BTCUSDT", 50.0, 50.0, &thresholds).signal_type, SignalType::Long);

        h.reset("BTCUSDT");
        assert_eq!(h.decide("BTCUSDT", 50.0, 50.0, &thresholds).signal_type, SignalType::Neutral);
    }

    #[test]
    fn test_thresholds_accept_short_keys() {
        let parsed: Thresholds = serde_json::from_str(r#"{"long": 65, "short": 30, "neutral_buffer": 2}"#).unwrap();
        assert_eq!(parsed, Thresholds::new(65.0, 30.0, 2.0));
        let defaults: Thresholds = serde_json::from_str("{}").unwrap();
        assert_eq!(defaults, Thresholds::default());
    }
}
