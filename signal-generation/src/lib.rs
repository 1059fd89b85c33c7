// Signal Generation
// Validates collected market data and turns confluence scores into trade decisions

pub mod decision;
pub mod pipeline;
pub mod settings;
pub mod storage;
pub mod trade_params;
pub mod validation;

pub use decision::{decide, DecisionEngine, HysteresisMode, StatefulHysteresis, Thresholds, Zone};
pub use pipeline::{ConfluenceScorer, PipelineConfig, SignalPipeline, SkipReason, SymbolResult};
pub use settings::{PipelineSettings, RedisSettings};
pub use storage::{BreakdownCache, DecisionBreakdown, InMemoryBreakdownCache, RedisBreakdownCache};
pub use trade_params::{
    compute_or_default, PercentageParams, RiskManagedParams, TradeParamCalculator, TradeParamError,
    PROFIT_LADDER,
};
pub use validation::{
    DataValidator, SnapshotValidator, SyncOutcome, TimeSyncValidator, ValidationConfig, ValidationIssue,
    ValidationMode, ValidationReport,
};
