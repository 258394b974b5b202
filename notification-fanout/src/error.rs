use thiserror::Error;

/// Crate-wide error taxonomy.
///
/// Transport and bus clients classify their own failures into one of these
/// variants at the boundary; call sites never match on raw HTTP status codes
/// or driver errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Infrastructure hiccup: bus unavailable, store throttled, transport
    /// 5xx/timeout. Safe to retry.
    #[error("transient infrastructure error: {0}")]
    Transient(String),

    /// Malformed or otherwise unprocessable input. Never retried, never
    /// sent to the DLQ.
    #[error("permanent payload error: {0}")]
    Permanent(String),

    /// An invariant the core relies on was violated. These are programmer
    /// errors and are allowed to escape and terminate the task.
    #[error("invariant violation: {0}")]
    Invariant(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn transient(msg: impl Into<String>) -> Self {
        Error::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Error::Permanent(msg.into())
    }

    /// True if a caller should retry the operation that produced this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transient(_) | Error::Database(_))
    }
}
