// Trade Parameters
// Stop, target, size and take-profit ladder for directional decisions

use std::sync::Arc;

use common::{ProfitTarget, SignalType, TradeParameters};
use portfolio_risk::{PositionSide, RiskError, RiskManager, TradingConfig};
use thiserror::Error;
use tracing::{debug, warn};

/// Partial-profit ladder: (multiple of the stop distance, share of position).
pub const PROFIT_LADDER: [(f64, f64); 3] = [(1.5, 0.5), (2.5, 0.3), (4.0, 0.2)];

#[derive(Debug, Error)]
pub enum TradeParamError {
    #[error("no trade parameters for a NEUTRAL decision")]
    NotDirectional,

    #[error("entry price {0} is not a positive number")]
    InvalidEntry(f64),

    #[error("{field} came out as {value}")]
    NonFinite { field: &'static str, value: f64 },

    #[error("stop distance is zero")]
    ZeroStopDistance,

    #[error(transparent)]
    Risk(#[from] RiskError),
}

pub trait TradeParamCalculator: Send + Sync {
    fn calculate(
        &self,
        signal_type: SignalType,
        entry_price: f64,
        score: f64,
        reliability: f64,
    ) -> Result<TradeParameters, TradeParamError>;
}

/// Reliability on 0-100 mapped to a 0-1 confidence.
pub fn confidence_from(reliability: f64) -> f64 {
    if reliability.is_finite() {
        (reliability / 100.0).clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Runs `calculator`, swapping any error for entry-only parameters.
pub fn compute_or_default(
    calculator: &dyn TradeParamCalculator,
    signal_type: SignalType,
    entry_price: f64,
    score: f64,
    reliability: f64,
) -> TradeParameters {
    match calculator.calculate(signal_type, entry_price, score, reliability) {
        Ok(params) => params,
        Err(e) => {
            warn!(%signal_type, entry_price, error = %e, "trade parameter calculation failed, using safe default");
            TradeParameters::safe_default(entry_price, confidence_from(reliability))
        }
    }
}

fn side_of(signal_type: SignalType) -> Result<PositionSide, TradeParamError> {
    match signal_type {
        SignalType::Long => Ok(PositionSide::Long),
        SignalType::Short => Ok(PositionSide::Short),
        SignalType::Neutral => Err(TradeParamError::NotDirectional),
    }
}

fn check_entry(entry_price: f64) -> Result<(), TradeParamError> {
    if entry_price.is_finite() && entry_price > 0.0 {
        Ok(())
    } else {
        Err(TradeParamError::InvalidEntry(entry_price))
    }
}

fn finite(field: &'static str, value: f64) -> Result<f64, TradeParamError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(TradeParamError::NonFinite { field, value })
    }
}

fn ladder(entry_price: f64, stop_distance: f64, side: PositionSide) -> Result<Vec<ProfitTarget>, TradeParamError> {
    PROFIT_LADDER
        .iter()
        .map(|&(risk_multiple, size_fraction)| {
            let price = finite(
                "target price",
                entry_price + side.sign() * risk_multiple * stop_distance,
            )?;
            Ok(ProfitTarget {
                price,
                size_fraction,
                risk_multiple,
            })
        })
        .collect()
}

/// Delegates stop, target and sizing to a [`RiskManager`] for a fixed
/// account balance.
pub struct RiskManagedParams {
    manager: Arc<dyn RiskManager>,
    balance: f64,
}

impl RiskManagedParams {
    pub fn new(manager: Arc<dyn RiskManager>, balance: f64) -> Self {
        Self { manager, balance }
    }
}

impl TradeParamCalculator for RiskManagedParams {
    fn calculate(
        &self,
        signal_type: SignalType,
        entry_price: f64,
        _score: f64,
        reliability: f64,
    ) -> Result<TradeParameters, TradeParamError> {
        let side = side_of(signal_type)?;
        check_entry(entry_price)?;

        let levels = self.manager.calculate_stop_loss_take_profit(entry_price, side)?;
        let size = self
            .manager
            .calculate_position_size(self.balance, entry_price, levels.stop_loss, side)?;
        let stop_distance = (entry_price - levels.stop_loss).abs();
        if stop_distance == 0.0 {
            return Err(TradeParamError::ZeroStopDistance);
        }

        debug!(%signal_type, entry_price, stop = levels.stop_loss, size, "risk manager parameters");
        Ok(TradeParameters {
            entry_price,
            stop_loss: Some(finite("stop loss", levels.stop_loss)?),
            take_profit: Some(finite("take profit", levels.take_profit)?),
            position_size: Some(finite("position size", size)?),
            risk_reward_ratio: levels.risk_reward_ratio(entry_price).filter(|r| r.is_finite()),
            confidence: confidence_from(reliability),
            targets: ladder(entry_price, stop_distance, side)?,
        })
    }
}

/// Built-in sizing from fixed percentages, used when no risk manager is
/// configured. Risk per trade shrinks with weaker scores and lower
/// reliability.
pub struct PercentageParams {
    config: TradingConfig,
}

impl PercentageParams {
    pub fn new(config: TradingConfig) -> Result<Self, RiskError> {
        config.validate().map_err(RiskError::InvalidConfig)?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &TradingConfig {
        &self.config
    }
}

impl TradeParamCalculator for PercentageParams {
    fn calculate(
        &self,
        signal_type: SignalType,
        entry_price: f64,
        score: f64,
        reliability: f64,
    ) -> Result<TradeParameters, TradeParamError> {
        let side = side_of(signal_type)?;
        check_entry(entry_price)?;
        let sign = side.sign();
        let cfg = &self.config;

        let strength = finite("score", score)?.clamp(0.0, 100.0) / 100.0;
        let confidence = confidence_from(reliability);
        let risk_amount = cfg.balance * cfg.risk_percentage / 100.0 * strength.min(1.0) * confidence;

        let stop_distance = entry_price * cfg.stop_loss_pct / 100.0;
        if stop_distance <= 0.0 {
            return Err(TradeParamError::ZeroStopDistance);
        }
        let stop_loss = finite("stop loss", entry_price - sign * stop_distance)?;
        let take_profit = finite(
            "take profit",
            entry_price + sign * entry_price * cfg.take_profit_pct / 100.0,
        )?;

        let position_size = finite("position size", risk_amount / stop_distance)?;

        Ok(TradeParameters {
            entry_price,
            stop_loss: Some(stop_loss),
            take_profit: Some(take_profit),
            position_size: Some(position_size),
            risk_reward_ratio: Some(finite("risk/reward", cfg.take_profit_pct / cfg.stop_loss_pct)?),
            confidence,
            targets: ladder(entry_price, stop_distance, side)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portfolio_risk::FixedPercentRiskManager;

    fn config() -> TradingConfig {
        TradingConfig {
            balance: 10_000.0,
            risk_percentage: 1.0,
            stop_loss_pct: 2.0,
            take_profit_pct: 4.0,
            leverage: 10.0,
        }
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_percentage_long() {
        let calc = PercentageParams::new(config()).unwrap();
        let p = calc.calculate(SignalType::Long, 100.0, 80.0, 50.0).unwrap();

        assert_eq!(p.stop_loss, Some(98.0));
        assert_eq!(p.take_profit, Some(104.0));
        // 10_000 * 1% * 0.8 * 0.5 = 40 risked over a 2.0 stop distance
        assert!(approx(p.position_size.unwrap(), 20.0));
        assert_eq!(p.risk_reward_ratio, Some(2.0));
        assert_eq!(p.confidence, 0.5);

        let prices: Vec<f64> = p.targets.iter().map(|t| t.price).collect();
        assert_eq!(prices, vec![103.0, 105.0, 108.0]);
        let fractions: f64 = p.targets.iter().map(|t| t.size_fraction).sum();
        assert!(approx(fractions, 1.0));
    }

    #[test]
    fn test_percentage_short_is_mirrored() {
        let calc = PercentageParams::new(config()).unwrap();
        let p = calc.calculate(SignalType::Short, 100.0, 20.0, 100.0).unwrap();

        assert_eq!(p.stop_loss, Some(102.0));
        assert_eq!(p.take_profit, Some(96.0));
        let prices: Vec<f64> = p.targets.iter().map(|t| t.price).collect();
        assert_eq!(prices, vec![97.0, 95.0, 92.0]);
    }

    #[test]
    fn test_percentage_size_is_risk_over_stop_distance() {
        let calc = PercentageParams::new(TradingConfig {
            risk_percentage: 100.0,
            stop_loss_pct: 0.1,
            leverage: 1.0,
            ..config()
        })
        .unwrap();
        let p = calc.calculate(SignalType::Long, 100.0, 100.0, 100.0).unwrap();
        // the whole 10_000 balance risked over a 0.1 stop distance, leverage plays no part
        assert!((p.position_size.unwrap() - 100_000.0).abs() < 1e-6);
    }

    #[test]
    fn test_percentage_rejects_invalid_config() {
        let wide_stop = TradingConfig {
            stop_loss_pct: 100.0,
            ..config()
        };
        assert!(matches!(
            PercentageParams::new(wide_stop),
            Err(RiskError::InvalidConfig(_))
        ));
        let no_balance = TradingConfig {
            balance: 0.0,
            ..config()
        };
        assert!(PercentageParams::new(no_balance).is_err());
    }

    #[test]
    fn test_errors_fall_back_to_safe_default() {
        let calc = PercentageParams::new(config()).unwrap();
        assert!(matches!(
            calc.calculate(SignalType::Long, 0.0, 80.0, 50.0),
            Err(TradeParamError::InvalidEntry(_))
        ));
        assert!(matches!(
            calc.calculate(SignalType::Neutral, 100.0, 50.0, 50.0),
            Err(TradeParamError::NotDirectional)
        ));

        let p = compute_or_default(&calc, SignalType::Long, -5.0, 80.0, 250.0);
        assert_eq!(p.entry_price, -5.0);
        assert!(p.stop_loss.is_none() && p.take_profit.is_none() && p.position_size.is_none());
        assert_eq!(p.confidence, 1.0);
        assert!(p.targets.is_empty());
    }

    #[test]
    fn test_zero_stop_is_an_error() {
        // bypasses construction-time validation to reach the per-call guard
        let calc = PercentageParams {
            config: TradingConfig {
                stop_loss_pct: 0.0,
                ..config()
            },
        };
        assert!(matches!(
            calc.calculate(SignalType::Long, 100.0, 80.0, 50.0),
            Err(TradeParamError::ZeroStopDistance)
        ));
    }

    #[test]
    fn test_risk_managed_params() {
        let manager = Arc::new(FixedPercentRiskManager::new(config()).unwrap());
        let calc = RiskManagedParams::new(manager, 5_000.0);
        let p = calc.calculate(SignalType::Long, 100.0, 90.0, 40.0).unwrap();

        assert!(approx(p.stop_loss.unwrap(), 98.0));
        assert!(approx(p.take_profit.unwrap(), 104.0));
        // 5_000 * 1% = 50 risked over a 2.0 stop distance
        assert!(approx(p.position_size.unwrap(), 25.0));
        assert!(approx(p.risk_reward_ratio.unwrap(), 2.0));
        assert_eq!(p.confidence, 0.4);
        assert_eq!(p.targets.len(), 3);
    }
}
