use std::future::Future;
use std::time::Duration;

use serde::Serialize;

/// A named external call exceeded its deadline. Carries enough context for
/// the caller to decide whether a retry makes sense.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("{operation} timed out after {timeout_ms}ms")]
pub struct TimeoutError {
    pub operation: String,
    pub timeout_ms: u64,
}

/// Wrap an external call with a named deadline. On expiry the future is
/// dropped and a `TimeoutError` naming the operation is returned.
pub async fn named_timeout<T>(
    operation: &str,
    timeout: Duration,
    fut: impl Future<Output = T>,
) -> Result<T, TimeoutError> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(value) => Ok(value),
        Err(_) => Err(TimeoutError {
            operation: operation.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}
