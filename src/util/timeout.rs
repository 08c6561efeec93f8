//! Timeout helper.

use std::future::Future;
use std::time::Duration;

use crate::error::TetherError;

/// Wrap a future with a timeout; elapsing counts as a transient `ETIMEDOUT`.
pub async fn with_timeout<T>(
    duration: Duration,
    future: impl Future<Output = Result<T, TetherError>>,
) -> Result<T, TetherError> {
    match tokio::time::timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(TetherError::transient_code(
            "ETIMEDOUT",
            format!("timed out after {}ms", duration.as_millis()),
        )),
    }
}
