// Example: Live Signal Pipeline
// Streams Bybit public data, scores it with a toy momentum scorer and prints decisions
//
// Run with an optional settings file:
//   cargo run -p signal-generation --example live_pipeline -- pipeline.toml

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use common::{ConfluenceResult, MarketSnapshot};
use data_ingestion::{spawn_bybit_feed, BybitConnector, DataCollector, StreamingStore};
use monitoring::{init_tracing, LoggingSignalSink, PrometheusMetrics};
use signal_generation::{
    BreakdownCache, ConfluenceScorer, DecisionEngine, InMemoryBreakdownCache, PercentageParams,
    PipelineSettings, RedisBreakdownCache, SignalPipeline, SnapshotValidator,
};
use tracing::{info, warn};

/// Scores the base timeframe's close against its first candle plus the
/// order book imbalance. Only here to drive the pipeline.
struct MomentumScorer;

#[async_trait]
impl ConfluenceScorer for MomentumScorer {
    async fn score(&self, snapshot: &MarketSnapshot) -> Result<ConfluenceResult> {
        let candles = snapshot
            .ohlcv
            .get("base")
            .filter(|c| c.len() >= 2)
            .ok_or_else(|| anyhow::anyhow!("no base candles for {}", snapshot.symbol))?;
        let (first, last) = (candles[0].close, candles[candles.len() - 1].close);
        let change_pct = (last - first) / first * 100.0;
        let momentum = (50.0 + change_pct * 10.0).clamp(0.0, 100.0);

        let imbalance = snapshot.orderbook.as_ref().map(|book| {
            let bids: f64 = book.bids.iter().take(10).map(|l| l.size).sum();
            let asks: f64 = book.asks.iter().take(10).map(|l| l.size).sum();
            if bids + asks > 0.0 {
                bids / (bids + asks) * 100.0
            } else {
                50.0
            }
        });

        let mut components = std::collections::HashMap::from([("momentum".to_string(), momentum)]);
        let score = match imbalance {
            Some(imbalance) => {
                components.insert("book_imbalance".to_string(), imbalance);
                momentum * 0.7 + imbalance * 0.3
            }
            None => momentum,
        };
        let reliability = 100.0 - snapshot.missing_fields.len() as f64 * 10.0;

        Ok(ConfluenceResult {
            score,
            reliability: reliability.max(0.0),
            components,
            metadata: serde_json::Value::Null,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("info,signal_generation=debug");

    let path = std::env::args().nth(1).map(PathBuf::from);
    let mut settings = PipelineSettings::load(path.as_deref())?;
    if settings.symbols.is_empty() {
        settings.symbols = vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()];
    }
    info!(symbols = ?settings.symbols, "starting live pipeline");

    let connector = Arc::new(BybitConnector::new(settings.exchange.clone())?);
    let mut collector = DataCollector::new(connector, settings.collector.clone());
    if settings.streaming.enabled {
        let store = Arc::new(StreamingStore::new(settings.streaming.clone()));
        spawn_bybit_feed(store.clone(), settings.symbols.clone());
        collector = collector.with_stream(store);
    }

    let breakdowns: Arc<dyn BreakdownCache> = match &settings.redis {
        Some(redis) => match RedisBreakdownCache::connect(&redis.url, redis.ttl_secs).await {
            Ok(cache) => Arc::new(cache),
            Err(e) => {
                warn!(error = %e, "redis unavailable, keeping breakdowns in memory");
                Arc::new(InMemoryBreakdownCache::new())
            }
        },
        None => Arc::new(InMemoryBreakdownCache::new()),
    };

    let metrics = Arc::new(PrometheusMetrics::new("live_pipeline")?);
    let engine = DecisionEngine::new(
        settings.thresholds,
        Arc::new(PercentageParams::new(settings.trading.clone())?),
    )
    .with_hysteresis(settings.hysteresis);

    let pipeline = SignalPipeline::new(
        Arc::new(collector),
        Arc::new(SnapshotValidator::new(settings.validation.clone())),
        Arc::new(MomentumScorer),
        engine,
        settings.pipeline.clone(),
    )
    .with_signal_sink(Arc::new(LoggingSignalSink))
    .with_metrics(metrics.clone())
    .with_breakdown_cache(breakdowns);

    // let the stream fill before the first cycle
    tokio::time::sleep(Duration::from_secs(5)).await;

    let mut ticker = tokio::time::interval(Duration::from_secs(30));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let results = pipeline.process_batch(&settings.symbols).await;
                for r in &results {
                    info!(
                        symbol = %r.symbol,
                        signal = ?r.signal_type(),
                        forwarded = r.forwarded(),
                        skipped = ?r.skipped,
                        "cycle result"
                    );
                }
                let stats = pipeline.collector().stats();
                info!(?stats, "collector stats");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }

    pipeline.stop().await;
    println!("{}", metrics.render()?);
    Ok(())
}
