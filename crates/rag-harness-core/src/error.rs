//! Error taxonomy for the retrieval core.
//!
//! Every library operation returns [`Result`]. Callers can tell capacity
//! and timeout conditions apart from hard failures via
//! [`Error::is_retryable`].

use std::time::Duration;

use thiserror::Error;

/// Result type for retrieval-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the retrieval core.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// The pool could not produce a healthy connection after bounded retries.
    #[error("connection error: {0}")]
    Connection(String),

    /// No pooled connection was released within the acquire timeout.
    #[error("connection pool exhausted: no connection became available within {}ms", .waited.as_millis())]
    PoolExhausted {
        /// How long the caller waited.
        waited: Duration,
    },

    /// Malformed, empty, or oversized input, or a failed ingestion write.
    #[error("ingestion error: {0}")]
    Ingestion(String),

    /// Query-time database failure.
    #[error("retrieval error: {0}")]
    Retrieval(String),

    /// The embedding model failed or produced an unusable vector.
    #[error("embedding error: {0}")]
    Embedding(String),

    /// A query was rejected before any work was done (bad k, alpha, threshold).
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl Error {
    /// Whether the caller should back off and try again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::PoolExhausted { .. } | Error::Connection(_))
    }
}
