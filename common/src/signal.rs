use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Output of the external multi-indicator scorer. Opaque to this workspace
/// apart from the two headline numbers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfluenceResult {
    /// 0-100, higher is more bullish
    pub score: f64,
    /// 0-100
    pub reliability: f64,
    #[serde(default)]
    pub components: HashMap<String, f64>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalType {
    Long,
    Short,
    Neutral,
}

impl SignalType {
    pub fn is_directional(&self) -> bool {
        !matches!(self, SignalType::Neutral)
    }
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SignalType::Long => "LONG",
            SignalType::Short => "SHORT",
            SignalType::Neutral => "NEUTRAL",
        };
        f.write_str(s)
    }
}

/// One rung of the partial take-profit ladder.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProfitTarget {
    pub price: f64,
    /// Fraction of the position closed at this rung, 0.0-1.0
    pub size_fraction: f64,
    /// Distance from entry as a multiple of the stop distance
    pub risk_multiple: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeParameters {
    pub entry_price: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub position_size: Option<f64>,
    pub risk_reward_ratio: Option<f64>,
    pub confidence: f64,
    pub targets: Vec<ProfitTarget>,
}

impl TradeParameters {
    /// Entry only; used whenever the full calculation cannot be trusted.
    pub fn safe_default(entry_price: f64, confidence: f64) -> Self {
        let confidence = if confidence.is_finite() {
            confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            entry_price,
            stop_loss: None,
            take_profit: None,
            position_size: None,
            risk_reward_ratio: None,
            confidence,
            targets: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalDecision {
    pub signal_type: SignalType,
    pub score: f64,
    pub reliability: f64,
    pub trade_params: Option<TradeParameters>,
    pub decided_at: DateTime<Utc>,
}

impl SignalDecision {
    pub fn neutral(score: f64, reliability: f64) -> Self {
        Self {
            signal_type: SignalType::Neutral,
            score,
            reliability,
            trade_params: None,
            decided_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_default_clamps_confidence() {
        assert_eq!(TradeParameters::safe_default(100.0, 1.7).confidence, 1.0);
        assert_eq!(TradeParameters::safe_default(100.0, -0.2).confidence, 0.0);
        assert_eq!(TradeParameters::safe_default(100.0, f64::NAN).confidence, 0.0);
        assert!(TradeParameters::safe_default(100.0, 0.5).stop_loss.is_none());
    }

    #[test]
    fn test_signal_type_serializes_uppercase() {
        let json = serde_json::to_string(&SignalType::Long).unwrap();
        assert_eq!(json, r#""LONG""#);
        assert!(!SignalType::Neutral.is_directional());
    }
}
