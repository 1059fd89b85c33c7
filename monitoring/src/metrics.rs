//! Numeric per-symbol metrics.
//!
//! Every write is a `(symbol, field, value, timestamp)` point. The pipeline
//! treats sinks as fire-and-forget: a failed write is logged, never retried.

use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use prometheus::{Encoder, GaugeVec, IntCounterVec, Opts, Registry, TextEncoder};
use serde::Serialize;

use crate::error::SinkError;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricPoint {
    pub symbol: String,
    pub field: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

impl MetricPoint {
    pub fn new(symbol: impl Into<String>, field: impl Into<String>, value: f64) -> Self {
        Self {
            symbol: symbol.into(),
            field: field.into(),
            value,
            timestamp: Utc::now(),
        }
    }
}

pub trait MetricsSink: Send + Sync {
    fn record(&self, point: MetricPoint) -> Result<(), SinkError>;

    fn record_all(&self, points: Vec<MetricPoint>) -> Result<(), SinkError> {
        points.into_iter().try_for_each(|p| self.record(p))
    }
}

fn check_finite(point: &MetricPoint) -> Result<(), SinkError> {
    if point.value.is_finite() {
        Ok(())
    } else {
        Err(SinkError::NonFinite {
            symbol: point.symbol.clone(),
            field: point.field.clone(),
        })
    }
}

/// Keeps every point in memory.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    points: Mutex<Vec<MetricPoint>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn points(&self) -> Vec<MetricPoint> {
        self.points.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn latest(&self, symbol: &str, field: &str) -> Option<f64> {
        self.points
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .rev()
            .find(|p| p.symbol == symbol && p.field == field)
            .map(|p| p.value)
    }

    pub fn len(&self) -> usize {
        self.points.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MetricsSink for InMemoryMetrics {
    fn record(&self, point: MetricPoint) -> Result<(), SinkError> {
        check_finite(&point)?;
        self.points
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(point);
        Ok(())
    }
}

/// Prometheus gauges labelled by symbol and field, plus a write counter.
pub struct PrometheusMetrics {
    registry: Registry,
    values: GaugeVec,
    updated: GaugeVec,
    writes: IntCounterVec,
}

impl PrometheusMetrics {
    pub fn new(namespace: &str) -> Result<Self, SinkError> {
        Self::with_registry(Registry::new(), namespace)
    }

    pub fn with_registry(registry: Registry, namespace: &str) -> Result<Self, SinkError> {
        let values = GaugeVec::new(
            Opts::new("signal_metric", "Latest value per symbol and field").namespace(namespace),
            &["symbol", "field"],
        )?;
        let updated = GaugeVec::new(
            Opts::new("signal_metric_timestamp_seconds", "Unix time of the latest value")
                .namespace(namespace),
            &["symbol", "field"],
        )?;
        let writes = IntCounterVec::new(
            Opts::new("signal_metric_writes_total", "Metric points written per symbol")
                .namespace(namespace),
            &["symbol"],
        )?;
        registry.register(Box::new(values.clone()))?;
        registry.register(Box::new(updated.clone()))?;
        registry.register(Box::new(writes.clone()))?;
        Ok(Self {
            registry,
            values,
            updated,
            writes,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Text exposition format.
    pub fn render(&self) -> Result<String, SinkError> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| SinkError::Encoding(e.to_string()))
    }
}

impl MetricsSink for PrometheusMetrics {
    fn record(&self, point: MetricPoint) -> Result<(), SinkError> {
        check_finite(&point)?;
        let labels = [point.symbol.as_str(), point.field.as_str()];
        self.values.with_label_values(&labels).set(point.value);
        self.updated
            .with_label_values(&labels)
            .set(point.timestamp.timestamp_millis() as f64 / 1000.0);
        self.writes.with_label_values(&[point.symbol.as_str()]).inc();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_latest() {
        let sink = InMemoryMetrics::new();
        sink.record(MetricPoint::new("BTCUSDT", "score", 61.0)).unwrap();
        sink.record(MetricPoint::new("BTCUSDT", "score", 72.5)).unwrap();
        assert_eq!(sink.latest("BTCUSDT", "score"), Some(72.5));
        assert_eq!(sink.latest("ETHUSDT", "score"), None);
        assert_eq!(sink.len(), 2);
    }

    #[test]
    fn test_rejects_non_finite() {
        let sink = InMemoryMetrics::new();
        let err = sink.record(MetricPoint::new("BTCUSDT", "score", f64::NAN));
        assert!(matches!(err, Err(SinkError::NonFinite { .. })));
        assert!(sink.is_empty());
    }

    #[test]
    fn test_prometheus_render() {
        let sink = PrometheusMetrics::new("pipeline").unwrap();
        sink.record_all(vec![
            MetricPoint::new("BTCUSDT", "score", 72.5),
            MetricPoint::new("BTCUSDT", "reliability", 40.0),
        ])
        .unwrap();

        let text = sink.render().unwrap();
        assert!(text.contains("pipeline_signal_metric{field=\"score\",symbol=\"BTCUSDT\"} 72.5"));
        assert!(text.contains("pipeline_signal_metric_writes_total{symbol=\"BTCUSDT\"} 2"));
    }
}
