//! Outbound sinks for the signal pipeline: numeric metrics, forwarded
//! signals, and process-wide tracing setup.

pub mod alerts;
pub mod error;
pub mod metrics;
pub mod telemetry;

pub use alerts::{ChannelSignalSink, ForwardedSignal, LoggingSignalSink, SignalSink};
pub use error::SinkError;
pub use metrics::{InMemoryMetrics, MetricPoint, MetricsSink, PrometheusMetrics};
pub use telemetry::init_tracing;
