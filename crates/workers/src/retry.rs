//! Bounded retry for transient store failures.

use faultline_core::{PipelineError, PipelineResult};
use tracing::warn;

const MAX_ATTEMPTS: u32 = 3;

/// Run `operation` with exponential backoff on transient store errors.
/// Validation and permanent errors propagate immediately.
pub async fn with_retry<T, F, Fut>(name: &str, operation: F) -> PipelineResult<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = PipelineResult<T>>,
{
    let mut last_err = None;
    for attempt in 0..MAX_ATTEMPTS {
        if attempt > 0 {
            let delay = std::time::Duration::from_millis(200 * 2u64.pow(attempt - 1));
            tokio::time::sleep(delay).await;
        }
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() => {
                warn!(operation = name, attempt, error = %e, "Transient store error, retrying");
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err
        .unwrap_or_else(|| PipelineError::TransientStore(format!("{name}: retries exhausted"))))
}
