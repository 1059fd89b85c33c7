/// Failure writing to a downstream sink. Callers log it and move on.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("metric {field} for {symbol} is not a finite number")]
    NonFinite { symbol: String, field: String },

    #[error("prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),

    #[error("signal consumer has gone away")]
    Closed,

    #[error("failed to encode output: {0}")]
    Encoding(String),
}
