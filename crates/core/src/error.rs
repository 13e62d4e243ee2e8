use thiserror::Error;

pub type PipelineResult<T> = Result<T, PipelineError>;

/// Error taxonomy shared by every worker and the API surface.
///
/// HTTP handlers map `Validation` to 4xx and everything else to 5xx with a
/// sanitized message. Workers log and continue on everything except `Fatal`.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Malformed input. Never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Store timeout or connection reset. Retried with backoff up to 3 attempts.
    #[error("Transient store error: {0}")]
    TransientStore(String),

    /// Constraint violation or similar. Logged, not retried, not fatal.
    #[error("Permanent store error: {0}")]
    PermanentStore(String),

    /// Optional dependency is down; the pipeline proceeds without it.
    #[error("Degraded dependency: {0}")]
    DegradedDependency(String),

    /// Interface contract broken (e.g. model feature-order mismatch).
    #[error("Contract error: {0}")]
    Contract(String),

    /// Broker publish/subscribe failure.
    #[error("Broker error: {0}")]
    Broker(String),

    /// Programming invariant violated. Crashes the worker.
    #[error("Fatal error: {0}")]
    Fatal(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl PipelineError {
    /// Whether a worker should retry the operation that produced this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::TransientStore(_))
    }
}
