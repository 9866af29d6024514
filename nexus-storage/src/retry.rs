//! Bounded retry for store calls.

use std::future::Future;

use nexus_core::{GraphError, NexusError, NexusResult, RetryConfig, StoreError};

/// True for store failures worth retrying.
pub fn is_transient(err: &NexusError) -> bool {
    matches!(
        err,
        NexusError::Store(StoreError::Unavailable { .. })
            | NexusError::Store(StoreError::TransactionFailed { .. })
    )
}

/// Run `f` until it succeeds, retrying transient failures with doubling
/// backoff.
///
/// Returns [`GraphError::RetryExhausted`] once more than
/// `cfg.max_retries` attempts have failed. Non-transient errors are
/// returned immediately.
pub async fn with_retry<T, F, Fut>(cfg: &RetryConfig, operation: &str, mut f: F) -> NexusResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = NexusResult<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) if is_transient(&e) => {
                if attempt >= cfg.max_retries {
                    return Err(GraphError::RetryExhausted {
                        operation: operation.to_string(),
                        attempts: attempt + 1,
                        last_error: e.to_string(),
                    }
                    .into());
                }
                let delay = cfg.backoff(attempt);
                tracing::warn!(operation, attempt, ?delay, error = %e, "store call failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
