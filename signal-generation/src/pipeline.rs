// Signal Generation Pipeline
// Collects market data, validates it, scores it and turns the score into a decision

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use common::{ConfluenceResult, MarketSnapshot, SignalDecision, SignalType, SnapshotSource, Symbol};
use data_ingestion::DataCollector;
use futures::future::join_all;
use monitoring::{ForwardedSignal, MetricPoint, MetricsSink, SignalSink};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::decision::DecisionEngine;
use crate::storage::{BreakdownCache, DecisionBreakdown};
use crate::validation::{DataValidator, ValidationReport};

/// External multi-indicator scorer. Its internals are opaque here.
#[async_trait]
pub trait ConfluenceScorer: Send + Sync {
    async fn score(&self, snapshot: &MarketSnapshot) -> anyhow::Result<ConfluenceResult>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Directional decisions below this reliability are logged, not forwarded
    #[serde(default = "default_min_forward_reliability")]
    pub min_forward_reliability: f64,
    #[serde(default = "default_scoring_timeout_secs")]
    pub scoring_timeout_secs: u64,
}

fn default_enabled() -> bool {
    true
}

fn default_min_forward_reliability() -> f64 {
    30.0
}

fn default_scoring_timeout_secs() -> u64 {
    90
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            min_forward_reliability: default_min_forward_reliability(),
            scoring_timeout_secs: default_scoring_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    InvalidData,
    ScoringFailed(String),
    ScoringTimedOut,
}

/// What happened to one symbol in one cycle.
#[derive(Debug, Clone)]
pub struct SymbolResult {
    pub symbol: Symbol,
    pub trace_id: Uuid,
    pub source: Option<SnapshotSource>,
    pub validation: Option<ValidationReport>,
    pub confluence: Option<ConfluenceResult>,
    pub decision: Option<SignalDecision>,
    /// Set when the decision reached the signal sink
    pub signal_id: Option<Uuid>,
    pub skipped: Option<SkipReason>,
}

impl SymbolResult {
    fn new(symbol: &str, trace_id: Uuid) -> Self {
        Self {
            symbol: symbol.to_string(),
            trace_id,
            source: None,
            validation: None,
            confluence: None,
            decision: None,
            signal_id: None,
            skipped: None,
        }
    }

    fn skip(mut self, reason: SkipReason) -> Self {
        self.skipped = Some(reason);
        self
    }

    pub fn signal_type(&self) -> Option<SignalType> {
        self.decision.as_ref().map(|d| d.signal_type)
    }

    pub fn forwarded(&self) -> bool {
        self.signal_id.is_some()
    }
}

/// Signal generation pipeline
pub struct SignalPipeline {
    collector: Arc<DataCollector>,
    validator: Arc<dyn DataValidator>,
    scorer: Arc<dyn ConfluenceScorer>,
    engine: DecisionEngine,
    config: PipelineConfig,
    signal_sink: Option<Arc<dyn SignalSink>>,
    metrics: Option<Arc<dyn MetricsSink>>,
    breakdowns: Option<Arc<dyn BreakdownCache>>,
    stopped: AtomicBool,
}

impl SignalPipeline {
    pub fn new(
        collector: Arc<DataCollector>,
        validator: Arc<dyn DataValidator>,
        scorer: Arc<dyn ConfluenceScorer>,
        engine: DecisionEngine,
        config: PipelineConfig,
    ) -> Self {
        Self {
            collector,
            validator,
            scorer,
            engine,
            config,
            signal_sink: None,
            metrics: None,
            breakdowns: None,
            stopped: AtomicBool::new(false),
        }
    }

    pub fn with_signal_sink(mut self, sink: Arc<dyn SignalSink>) -> Self {
        self.signal_sink = Some(sink);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_breakdown_cache(mut self, cache: Arc<dyn BreakdownCache>) -> Self {
        self.breakdowns = Some(cache);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn collector(&self) -> &Arc<DataCollector> {
        &self.collector
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// One full cycle for a single symbol.
    pub async fn process_symbol(&self, symbol: &str) -> SymbolResult {
        if !self.accepting(symbol) {
            return SymbolResult::new(symbol, Uuid::new_v4()).skip(SkipReason::Disabled);
        }
        let snapshot = self.collector.fetch(symbol).await;
        self.evaluate(snapshot).await
    }

    /// Collects every symbol through the bounded batch fetch, then evaluates
    /// them concurrently. Results come back in input order, duplicates
    /// removed.
    pub async fn process_batch(&self, symbols: &[Symbol]) -> Vec<SymbolResult> {
        if !self.config.enabled || self.is_stopped() {
            debug!("pipeline not accepting work, skipping batch");
            return symbols
                .iter()
                .map(|s| SymbolResult::new(s, Uuid::new_v4()).skip(SkipReason::Disabled))
                .collect();
        }

        let mut snapshots = self.collector.fetch_batch(symbols).await;
        let mut ordered = Vec::with_capacity(snapshots.len());
        for symbol in symbols {
            if let Some(snapshot) = snapshots.remove(symbol) {
                ordered.push(snapshot);
            }
        }
        let results = join_all(ordered.into_iter().map(|s| self.evaluate(s))).await;

        let directional = results.iter().filter(|r| r.forwarded()).count();
        info!(symbols = results.len(), forwarded = directional, "batch processed");
        results
    }

    /// Stops accepting work and shuts the streaming feed down, waiting for
    /// it to finish.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(stream) = self.collector.stream() {
            stream.close().await;
        }
        info!("signal pipeline stopped");
    }

    fn accepting(&self, symbol: &str) -> bool {
        if !self.config.enabled {
            debug!(symbol, "pipeline disabled");
            return false;
        }
        if self.is_stopped() {
            debug!(symbol, "pipeline stopped");
            return false;
        }
        true
    }

    async fn evaluate(&self, snapshot: MarketSnapshot) -> SymbolResult {
        let trace_id = Uuid::new_v4();
        let symbol = snapshot.symbol.clone();
        let mut result = SymbolResult::new(&symbol, trace_id);
        result.source = Some(snapshot.source);

        let report = self.validator.validate(&snapshot);
        self.emit(&symbol, "data_quality", report.quality_score);
        let valid = report.valid;
        result.validation = Some(report);
        if !valid {
            warn!(
                %symbol,
                %trace_id,
                quality = result.validation.as_ref().map(|r| r.quality_score),
                "snapshot rejected by validation, not scoring"
            );
            return result.skip(SkipReason::InvalidData);
        }

        let deadline = Duration::from_secs(self.config.scoring_timeout_secs);
        let confluence = match tokio::time::timeout(deadline, self.scorer.score(&snapshot)).await {
            Ok(Ok(confluence)) => confluence,
            Ok(Err(e)) => {
                warn!(%symbol, %trace_id, error = %e, "scoring failed");
                return result.skip(SkipReason::ScoringFailed(e.to_string()));
            }
            Err(_) => {
                warn!(%symbol, %trace_id, timeout = ?deadline, "scoring timed out");
                return result.skip(SkipReason::ScoringTimedOut);
            }
        };

        let decision = self
            .engine
            .evaluate(&symbol, &confluence, snapshot.reference_price());

        let forward = decision.signal_type.is_directional()
            && decision.reliability >= self.config.min_forward_reliability;
        if forward {
            result.signal_id = self.forward(&symbol, trace_id, &decision, &confluence).await;
        } else {
            info!(
                %symbol,
                %trace_id,
                signal_type = %decision.signal_type,
                score = decision.score,
                reliability = decision.reliability,
                "decision logged only"
            );
        }

        self.emit_decision(&symbol, &decision, &confluence);
        self.store_breakdown(&snapshot, &result, &decision, &confluence).await;

        result.confluence = Some(confluence);
        result.decision = Some(decision);
        result
    }

    async fn forward(
        &self,
        symbol: &str,
        trace_id: Uuid,
        decision: &SignalDecision,
        confluence: &ConfluenceResult,
    ) -> Option<Uuid> {
        let Some(sink) = &self.signal_sink else {
            info!(symbol, %trace_id, signal_type = %decision.signal_type, "no signal sink configured");
            return None;
        };
        let signal = ForwardedSignal::new(symbol, trace_id, decision.clone())
            .with_components(confluence.components.clone());
        let signal_id = signal.signal_id;
        match sink.send(signal).await {
            Ok(()) => {
                info!(
                    symbol,
                    %signal_id,
                    %trace_id,
                    signal_type = %decision.signal_type,
                    score = decision.score,
                    reliability = decision.reliability,
                    "signal forwarded"
                );
                Some(signal_id)
            }
            Err(e) => {
                warn!(symbol, %signal_id, error = %e, "failed to forward signal");
                None
            }
        }
    }

    fn emit(&self, symbol: &str, field: &str, value: f64) {
        if let Some(metrics) = &self.metrics {
            if let Err(e) = metrics.record(MetricPoint::new(symbol, field, value)) {
                debug!(symbol, field, error = %e, "metric dropped");
            }
        }
    }

    fn emit_decision(&self, symbol: &str, decision: &SignalDecision, confluence: &ConfluenceResult) {
        let direction = match decision.signal_type {
            SignalType::Long => 1.0,
            SignalType::Short => -1.0,
            SignalType::Neutral => 0.0,
        };
        self.emit(symbol, "confluence_score", decision.score);
        self.emit(symbol, "reliability", decision.reliability);
        self.emit(symbol, "signal_direction", direction);
        for (name, value) in &confluence.components {
            self.emit(symbol, &format!("component_{name}"), *value);
        }
        if let Some(params) = &decision.trade_params {
            self.emit(symbol, "entry_price", params.entry_price);
            if let Some(size) = params.position_size {
                self.emit(symbol, "position_size", size);
            }
        }
    }

    async fn store_breakdown(
        &self,
        snapshot: &MarketSnapshot,
        result: &SymbolResult,
        decision: &SignalDecision,
        confluence: &ConfluenceResult,
    ) {
        let Some(cache) = &self.breakdowns else {
            return;
        };
        let report = result.validation.as_ref();
        let breakdown = DecisionBreakdown {
            symbol: snapshot.symbol.clone(),
            trace_id: result.trace_id,
            decision: decision.clone(),
            confluence: confluence.clone(),
            quality_score: report.map_or(0.0, |r| r.quality_score),
            data_valid: report.is_some_and(|r| r.valid),
            issues: report
                .map(|r| r.issues.iter().map(|i| format!("{}: {}", i.field, i.message)).collect())
                .unwrap_or_default(),
            missing_fields: snapshot.missing_fields.clone(),
            source: snapshot.source,
            forwarded: result.forwarded(),
            created_at: Utc::now(),
        };
        if let Err(e) = cache.put(&breakdown).await {
            warn!(symbol = %snapshot.symbol, error = %e, "breakdown cache write failed");
        }
    }
}
