//! Retry with exponential backoff and jitter.

use std::future::Future;
use std::time::Duration;

use bon::Builder;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::TetherError;

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    #[builder(default = 3)]
    pub max_retries: u32,
    /// Delay before the first retry.
    #[builder(default = Duration::from_secs(1))]
    #[serde(with = "crate::util::duration_ms")]
    pub initial_delay: Duration,
    /// Upper bound for the un-jittered delay.
    #[builder(default = Duration::from_secs(10))]
    #[serde(with = "crate::util::duration_ms")]
    pub max_delay: Duration,
    /// Backoff multiplier.
    #[builder(default = 2.0)]
    pub factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Details of a scheduled retry, handed to the notify callback.
#[derive(Debug)]
pub struct RetryAttempt<'a> {
    /// 1-based retry number.
    pub attempt: u32,
    pub delay: Duration,
    pub error: &'a TetherError,
}

impl RetryPolicy {
    /// Total attempts including the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// `initial_delay * factor^attempt`, capped at `max_delay`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = self.factor.max(1.0).powi(attempt.min(i32::MAX as u32) as i32);
        let millis = self.initial_delay.as_millis() as f64 * exp;
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Base delay with ±50% jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        Duration::from_secs_f64(base.as_secs_f64() * jitter)
    }

    /// Execute an async operation with retry.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T, TetherError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TetherError>>,
    {
        self.execute_with_notify(operation, |_| {}).await
    }

    /// Execute with retry, reporting every scheduled retry to `notify`.
    pub async fn execute_with_notify<F, Fut, T, N>(
        &self,
        mut operation: F,
        mut notify: N,
    ) -> Result<T, TetherError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TetherError>>,
        N: FnMut(RetryAttempt<'_>),
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if !e.is_retryable() || attempt >= self.max_retries {
                        return Err(e);
                    }

                    let delay = self.delay_for(attempt);
                    attempt += 1;
                    tracing::warn!(
                        attempt,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying after error"
                    );
                    notify(RetryAttempt {
                        attempt,
                        delay,
                        error: &e,
                    });
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
