//! Trading account configuration

use serde::{Deserialize, Serialize};

/// Account and per-trade risk settings. Percentages are in percent
/// (`1.0` = 1%).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradingConfig {
    /// Account balance in quote currency
    #[serde(default = "default_balance")]
    pub balance: f64,

    /// Share of the balance put at risk on one trade
    #[serde(default = "default_risk_percentage")]
    pub risk_percentage: f64,

    /// Stop distance from entry
    #[serde(default = "default_stop_loss_pct")]
    pub stop_loss_pct: f64,

    /// Target distance from entry
    #[serde(default = "default_take_profit_pct")]
    pub take_profit_pct: f64,

    /// Caps notional at `balance * leverage`
    #[serde(default = "default_leverage")]
    pub leverage: f64,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            balance: default_balance(),
            risk_percentage: default_risk_percentage(),
            stop_loss_pct: default_stop_loss_pct(),
            take_profit_pct: default_take_profit_pct(),
            leverage: default_leverage(),
        }
    }
}

fn default_balance() -> f64 {
    10_000.0
}

fn default_risk_percentage() -> f64 {
    1.0
}

fn default_stop_loss_pct() -> f64 {
    2.0
}

fn default_take_profit_pct() -> f64 {
    4.0
}

fn default_leverage() -> f64 {
    1.0
}

impl TradingConfig {
    pub fn validate(&self) -> Result<(), String> {
        let positive = [
            ("balance", self.balance),
            ("risk_percentage", self.risk_percentage),
            ("stop_loss_pct", self.stop_loss_pct),
            ("take_profit_pct", self.take_profit_pct),
            ("leverage", self.leverage),
        ];
        for (name, value) in positive {
            if !value.is_finite() || value <= 0.0 {
                return Err(format!("{name} must be a positive number, got {value}"));
            }
        }
        if self.risk_percentage > 100.0 || self.stop_loss_pct >= 100.0 {
            return Err("percentages must stay below 100".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TradingConfig::default();
        assert_eq!(config.risk_percentage, 1.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let config = TradingConfig {
            balance: 2_500.0,
            ..Default::default()
        };
        let serialized = toml::to_string(&config).unwrap();
        let deserialized: TradingConfig = toml::from_str(&serialized).unwrap();
        assert_eq!(config, deserialized);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: TradingConfig = toml::from_str("leverage = 3.0").unwrap();
        assert_eq!(config.leverage, 3.0);
        assert_eq!(config.stop_loss_pct, 2.0);
    }
}
