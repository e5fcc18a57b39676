//! Error types for the attune ingest service.

/// Top-level error type for the ingest/aggregation service.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// Caller-supplied input failed validation (bad UUID, wrong file
    /// extension, out-of-range interval). Surfaced as HTTP 400.
    #[error("validation error: {0}")]
    Validation(String),

    /// A bounded resource is exhausted (chunk queue full, temp dir
    /// unwritable). Surfaced as HTTP 503.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Transient row-store failure (timeout, connect error, 5xx). Logged
    /// and skipped; the next tick or chunk retries with fresh data.
    #[error("store transient error: {0}")]
    StoreTransient(String),

    /// Permanent row-store failure (malformed response, schema mismatch).
    /// The offending record is dropped; the service stays up.
    #[error("store fatal error: {0}")]
    StoreFatal(String),

    /// The external ML pipeline failed for a chunk.
    #[error("pipeline error: {0}")]
    Pipeline(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// HTTP edge error (bind failure, serve failure).
    #[error("http error: {0}")]
    Http(String),

    /// Startup/shutdown coordination error.
    #[error("lifecycle error: {0}")]
    Lifecycle(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, IngestError>;
