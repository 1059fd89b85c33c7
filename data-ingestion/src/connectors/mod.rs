pub mod bybit;
pub mod scripted;

pub use bybit::{BybitConfig, BybitConnector};
pub use scripted::ScriptedConnector;

use async_trait::async_trait;
use common::{Candle, LongShortRatio, OpenInterestPoint, OrderBook, RiskLimit, TakerVolumeRatio, Ticker, Trade};

use crate::error::{FetchError, FetchResult};

/// Optional endpoints a connector declares when it is built. The collector
/// never calls an optional method the connector has not declared.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectorCapabilities {
    pub long_short_ratio: bool,
    pub risk_limits: bool,
    pub premium_index: bool,
    pub taker_ratio: bool,
    pub open_interest_history: bool,
}

impl ConnectorCapabilities {
    pub fn all() -> Self {
        Self {
            long_short_ratio: true,
            risk_limits: true,
            premium_index: true,
            taker_ratio: true,
            open_interest_history: true,
        }
    }
}

/// Market-data access for one exchange.
///
/// The four core calls are required. The extensions default to
/// [`FetchError::Unsupported`] so a connector only implements what its venue
/// offers.
#[async_trait]
pub trait ExchangeConnector: Send + Sync {
    fn exchange_id(&self) -> &str;

    fn capabilities(&self) -> ConnectorCapabilities;

    async fn fetch_ticker(&self, symbol: &str) -> FetchResult<Ticker>;

    async fn fetch_order_book(&self, symbol: &str, depth: usize) -> FetchResult<OrderBook>;

    async fn fetch_trades(&self, symbol: &str, limit: usize) -> FetchResult<Vec<Trade>>;

    /// Candles oldest-first. `timeframe` is canonical (`"1m"`, `"4h"`).
    async fn fetch_ohlcv(&self, symbol: &str, timeframe: &str, limit: usize) -> FetchResult<Vec<Candle>>;

    async fn fetch_long_short_ratio(&self, _symbol: &str) -> FetchResult<LongShortRatio> {
        Err(FetchError::Unsupported("fetch_long_short_ratio"))
    }

    async fn fetch_risk_limits(&self, _symbol: &str) -> FetchResult<Vec<RiskLimit>> {
        Err(FetchError::Unsupported("fetch_risk_limits"))
    }

    async fn fetch_premium_index_kline(
        &self,
        _symbol: &str,
        _timeframe: &str,
        _limit: usize,
    ) -> FetchResult<Vec<Candle>> {
        Err(FetchError::Unsupported("fetch_premium_index_kline"))
    }

    async fn calculate_taker_buy_sell_ratio(&self, _symbol: &str) -> FetchResult<TakerVolumeRatio> {
        Err(FetchError::Unsupported("calculate_taker_buy_sell_ratio"))
    }

    /// History points in any order; callers sort.
    async fn fetch_open_interest_history(
        &self,
        _symbol: &str,
        _limit: usize,
    ) -> FetchResult<Vec<OpenInterestPoint>> {
        Err(FetchError::Unsupported("fetch_open_interest_history"))
    }
}
