//! Fixed-window rate limiting per session.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

use crate::error::TetherError;

/// Counter for one session's current window.
#[derive(Debug, Clone)]
struct RateLimitWindow {
    count: u32,
    reset_at: Instant,
}

/// Read-only view of a session's window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitState {
    pub count: u32,
    pub remaining: u32,
    pub limit: u32,
    /// Milliseconds until the window resets (0 when no window is open).
    pub reset_in_ms: u64,
}

/// `max` admissions per `window`, tracked per session.
#[derive(Debug)]
pub struct RateLimiter {
    max: u32,
    window: Duration,
    windows: Mutex<HashMap<String, RateLimitWindow>>,
}

impl RateLimiter {
    pub fn new(max: u32, window: Duration) -> Self {
        Self {
            max,
            window,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn limit(&self) -> u32 {
        self.max
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Count one admission, or fail with `RateLimitExceeded` without counting.
    pub fn try_acquire(&self, session_id: &str) -> Result<(), TetherError> {
        let now = Instant::now();
        let mut windows = self.windows.lock();
        let window = windows
            .entry(session_id.to_string())
            .or_insert_with(|| RateLimitWindow {
                count: 0,
                reset_at: now + self.window,
            });

        if now >= window.reset_at {
            window.count = 0;
            window.reset_at = now + self.window;
        }

        if window.count >= self.max {
            let retry_after = window.reset_at.saturating_duration_since(now);
            return Err(TetherError::RateLimitExceeded {
                session_id: session_id.to_string(),
                retry_after_ms: retry_after.as_millis() as u64,
            });
        }

        window.count += 1;
        Ok(())
    }

    /// Current window state; no side effects.
    pub fn state(&self, session_id: &str) -> RateLimitState {
        let now = Instant::now();
        let windows = self.windows.lock();
        match windows.get(session_id) {
            Some(window) if now < window.reset_at => RateLimitState {
                count: window.count,
                remaining: self.max.saturating_sub(window.count),
                limit: self.max,
                reset_in_ms: window.reset_at.saturating_duration_since(now).as_millis() as u64,
            },
            _ => RateLimitState {
                count: 0,
                remaining: self.max,
                limit: self.max,
                reset_in_ms: 0,
            },
        }
    }

    pub fn reset(&self, session_id: &str) {
        self.windows.lock().remove(session_id);
    }

    /// Number of sessions with a stored window, expired or not.
    pub fn tracked_sessions(&self) -> usize {
        self.windows.lock().len()
    }

    /// Drop windows that have already expired.
    pub fn prune(&self) -> usize {
        let now = Instant::now();
        let mut windows = self.windows.lock();
        let before = windows.len();
        windows.retain(|_, w| now < w.reset_at);
        before - windows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn blocks_after_max_and_resets_after_window() {
        let limiter = RateLimiter::new(2, Duration::from_millis(1000));
        limiter.try_acquire("s1").unwrap();
        limiter.try_acquire("s1").unwrap();

        let err = limiter.try_acquire("s1").unwrap_err();
        match err {
            TetherError::RateLimitExceeded {
                session_id,
                retry_after_ms,
            } => {
                assert_eq!(session_id, "s1");
                assert_eq!(retry_after_ms, 1000);
            }
            other => panic!("expected rate limit error, got {other:?}"),
        }

        tokio::time::advance(Duration::from_millis(1000)).await;
        limiter.try_acquire("s1").unwrap();
        assert_eq!(limiter.state("s1").count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sessions_have_independent_windows() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        limiter.try_acquire("a").unwrap();
        limiter.try_acquire("b").unwrap();
        assert!(limiter.try_acquire("a").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_admissions_are_not_counted() {
        let limiter = RateLimiter::new(1, Duration::from_secs(10));
        limiter.try_acquire("s").unwrap();
        assert!(limiter.try_acquire("s").is_err());
        assert!(limiter.try_acquire("s").is_err());

        let state = limiter.state("s");
        assert_eq!(state.count, 1);
        assert_eq!(state.remaining, 0);
        assert_eq!(state.reset_in_ms, 10_000);
    }

    #[tokio::test(start_paused = true)]
    async fn state_and_prune_treat_elapsed_windows_as_fresh() {
        let limiter = RateLimiter::new(3, Duration::from_millis(100));
        limiter.try_acquire("s").unwrap();
        tokio::time::advance(Duration::from_millis(150)).await;

        assert_eq!(limiter.state("s").remaining, 3);
        assert_eq!(limiter.tracked_sessions(), 1);
        assert_eq!(limiter.prune(), 1);
        assert_eq!(limiter.tracked_sessions(), 0);
    }
}
