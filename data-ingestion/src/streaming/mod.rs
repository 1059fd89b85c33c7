//! Push-updated market data held in memory per symbol.

pub mod feed;
pub mod normalize;
pub mod store;

pub use feed::spawn_bybit_feed;
pub use store::{StreamStatus, StreamingStore};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    #[serde(default = "default_max_trades")]
    pub max_trades: usize,
    #[serde(default = "default_max_liquidations")]
    pub max_liquidations: usize,
    /// Candles kept per interval.
    #[serde(default = "default_max_klines")]
    pub max_klines: usize,
    #[serde(default = "default_orderbook_depth")]
    pub orderbook_depth: usize,
    /// Canonical intervals to subscribe klines for.
    #[serde(default = "default_kline_intervals")]
    pub kline_intervals: Vec<String>,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
}

fn default_enabled() -> bool {
    true
}

fn default_ws_url() -> String {
    "wss://stream.bybit.com/v5/public/linear".to_string()
}

fn default_max_trades() -> usize {
    1000
}

fn default_max_liquidations() -> usize {
    500
}

fn default_max_klines() -> usize {
    300
}

fn default_orderbook_depth() -> usize {
    50
}

fn default_kline_intervals() -> Vec<String> {
    vec!["1m".into(), "5m".into(), "30m".into(), "4h".into()]
}

fn default_heartbeat_secs() -> u64 {
    20
}

fn default_reconnect_delay_secs() -> u64 {
    5
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            ws_url: default_ws_url(),
            max_trades: default_max_trades(),
            max_liquidations: default_max_liquidations(),
            max_klines: default_max_klines(),
            orderbook_depth: default_orderbook_depth(),
            kline_intervals: default_kline_intervals(),
            heartbeat_secs: default_heartbeat_secs(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
        }
    }
}
