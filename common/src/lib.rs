//! Shared market-data and signal types used across the workspace.

pub mod market;
pub mod signal;
pub mod timeframe;

pub use market::{
    Candle, DataKind, Liquidation, LongShortRatio, MarketSnapshot, OpenInterest,
    OpenInterestPoint, OrderBook, OrderBookLevel, PremiumIndex, RiskLimit, SnapshotSource,
    Symbol, TakerVolumeRatio, Ticker, Trade, TradeSide,
};
pub use signal::{ConfluenceResult, ProfitTarget, SignalDecision, SignalType, TradeParameters};
pub use timeframe::{canonical_interval, interval_seconds, TimeframeSpec};

pub use chrono::{DateTime, Utc};
pub use uuid::Uuid;
