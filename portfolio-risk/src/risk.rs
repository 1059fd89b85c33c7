//! Stop/target placement and position sizing

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::TradingConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// +1 for long, -1 for short: the direction price must move to profit.
    pub fn sign(self) -> f64 {
        match self {
            PositionSide::Long => 1.0,
            PositionSide::Short => -1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RiskError {
    #[error("entry price must be positive, got {0}")]
    InvalidEntry(f64),

    #[error("balance must be positive, got {0}")]
    InvalidBalance(f64),

    #[error("stop {stop} is on the wrong side of entry {entry} for a {side:?} position")]
    StopOnWrongSide {
        entry: f64,
        stop: f64,
        side: PositionSide,
    },

    #[error("invalid risk configuration: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StopTarget {
    pub stop_loss: f64,
    pub take_profit: f64,
}

impl StopTarget {
    pub fn risk_reward_ratio(&self, entry: f64) -> Option<f64> {
        let risk = (entry - self.stop_loss).abs();
        (risk > 0.0).then(|| (self.take_profit - entry).abs() / risk)
    }
}

/// Account-aware risk collaborator consulted when a directional signal
/// needs concrete trade parameters.
pub trait RiskManager: Send + Sync {
    fn calculate_stop_loss_take_profit(&self, entry: f64, side: PositionSide) -> Result<StopTarget, RiskError>;

    /// Position size in base units.
    fn calculate_position_size(
        &self,
        balance: f64,
        entry: f64,
        stop: f64,
        side: PositionSide,
    ) -> Result<f64, RiskError>;
}

/// Fixed-percentage stops and targets, risking a fixed share of the balance.
#[derive(Debug, Clone)]
pub struct FixedPercentRiskManager {
    config: TradingConfig,
}

impl FixedPercentRiskManager {
    pub fn new(config: TradingConfig) -> Result<Self, RiskError> {
        config.validate().map_err(RiskError::InvalidConfig)?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &TradingConfig {
        &self.config
    }
}

fn check_entry(entry: f64) -> Result<(), RiskError> {
    if entry.is_finite() && entry > 0.0 {
        Ok(())
    } else {
        Err(RiskError::InvalidEntry(entry))
    }
}

impl RiskManager for FixedPercentRiskManager {
    fn calculate_stop_loss_take_profit(&self, entry: f64, side: PositionSide) -> Result<StopTarget, RiskError> {
        check_entry(entry)?;
        let s = side.sign();
        Ok(StopTarget {
            stop_loss: entry * (1.0 - s * self.config.stop_loss_pct / 100.0),
            take_profit: entry * (1.0 + s * self.config.take_profit_pct / 100.0),
        })
    }

    fn calculate_position_size(
        &self,
        balance: f64,
        entry: f64,
        stop: f64,
        side: PositionSide,
    ) -> Result<f64, RiskError> {
        check_entry(entry)?;
        if !balance.is_finite() || balance <= 0.0 {
            return Err(RiskError::InvalidBalance(balance));
        }
        let distance = (entry - stop) * side.sign();
        if !distance.is_finite() || distance <= 0.0 {
            return Err(RiskError::StopOnWrongSide { entry, stop, side });
        }

        let risk_amount = balance * self.config.risk_percentage / 100.0;
        let size = risk_amount / distance;
        let max_size = balance * self.config.leverage / entry;
        let capped = size.min(max_size);
        if capped < size {
            debug!(size, max_size, "position size capped by leverage");
        }
        Ok(capped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> FixedPercentRiskManager {
        FixedPercentRiskManager::new(TradingConfig {
            balance: 10_000.0,
            risk_percentage: 1.0,
            stop_loss_pct: 2.0,
            take_profit_pct: 4.0,
            leverage: 5.0,
        })
        .unwrap()
    }

    #[test]
    fn test_long_levels() {
        let levels = manager().calculate_stop_loss_take_profit(100.0, PositionSide::Long).unwrap();
        assert!((levels.stop_loss - 98.0).abs() < 1e-9);
        assert!((levels.take_profit - 104.0).abs() < 1e-9);
        assert!((levels.risk_reward_ratio(100.0).unwrap() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_short_levels_are_mirrored() {
        let levels = manager().calculate_stop_loss_take_profit(100.0, PositionSide::Short).unwrap();
        assert!((levels.stop_loss - 102.0).abs() < 1e-9);
        assert!((levels.take_profit - 96.0).abs() < 1e-9);
    }

    #[test]
    fn test_position_size_from_risk_amount() {
        // 1% of 10k = 100 at risk over a 2.0 stop distance
        let size = manager().calculate_position_size(10_000.0, 100.0, 98.0, PositionSide::Long).unwrap();
        assert!((size - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_position_size_capped_by_leverage() {
        let size = manager().calculate_position_size(10_000.0, 100.0, 99.99, PositionSide::Long).unwrap();
        assert!((size - 500.0).abs() < 1e-9);
    }

    #[test]
    fn test_rejects_bad_inputs() {
        let m = manager();
        assert_eq!(
            m.calculate_stop_loss_take_profit(0.0, PositionSide::Long),
            Err(RiskError::InvalidEntry(0.0))
        );
        assert!(matches!(
            m.calculate_position_size(10_000.0, 100.0, 101.0, PositionSide::Long),
            Err(RiskError::StopOnWrongSide { .. })
        ));
        assert!(matches!(
            m.calculate_position_size(-1.0, 100.0, 98.0, PositionSide::Long),
            Err(RiskError::InvalidBalance(_))
        ));
        assert!(FixedPercentRiskManager::new(TradingConfig {
            leverage: f64::NAN,
            ..TradingConfig::default()
        })
        .is_err());
    }
}
