//! Market-data collection: exchange connectors, tiered caching, the
//! real-time streaming store and the per-symbol collector.

pub mod cache;
pub mod collector;
pub mod connectors;
pub mod error;
pub mod retry;
pub mod streaming;

pub use cache::{PrewarmedCache, SharedSnapshotCache, SnapshotCache, TtlCache};
pub use collector::{CollectorConfig, CollectorStats, DataCollector};
pub use connectors::{BybitConfig, BybitConnector, ConnectorCapabilities, ExchangeConnector, ScriptedConnector};
pub use error::{FetchError, FetchResult};
pub use retry::{with_retry, RetryPolicy};
pub use streaming::{spawn_bybit_feed, StreamStatus, StreamingConfig, StreamingStore};
