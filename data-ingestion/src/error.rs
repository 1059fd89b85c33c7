use std::time::Duration;

/// Failure of a single exchange call. Never escapes the collector: every
/// variant ends up as an unknown field in the snapshot.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("{0} is not supported by this connector")]
    Unsupported(&'static str),

    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: String,
        timeout: Duration,
    },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("exchange returned {code}: {message}")]
    Exchange { code: i64, message: String },

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("no data returned for {0}")]
    Empty(String),
}

impl FetchError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FetchError::Unsupported(_) | FetchError::InvalidPayload(_))
    }
}

pub type FetchResult<T> = Result<T, FetchError>;
