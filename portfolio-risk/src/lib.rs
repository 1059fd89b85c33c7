//! Account risk for directional signals
//!
//! Turns an entry price and direction into stop/target levels and a
//! position size sized off the account balance.

mod config;
mod risk;

pub use config::TradingConfig;
pub use risk::{FixedPercentRiskManager, PositionSide, RiskError, RiskManager, StopTarget};
