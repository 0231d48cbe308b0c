//! Fixed-attempt retry with a per-failure observation hook
//!
//! The orchestrator needs to see every failure as it happens (rate-limit
//! pushback must reach the limiter on the attempt it occurred, not after
//! exhaustion), so the policy takes an observer callback alongside the
//! operation.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Fixed-attempt, fixed-wait retry policy
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (1-based; 1 disables retries)
    pub max_attempts: u32,
    /// Wait between attempts
    pub wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            wait: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Create a policy with explicit attempts and wait
    #[must_use]
    pub fn new(max_attempts: u32, wait: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            wait,
        }
    }

    /// Run `operation` until it succeeds or attempts are exhausted
    ///
    /// `observe` is invoked for every failed attempt, including the last.
    /// Returns the value with the 1-based attempt count on success.
    pub async fn run<T, E, F, Fut>(
        &self,
        mut operation: F,
        mut observe: impl FnMut(&E),
    ) -> Result<(T, u32), RetryExhausted<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        for attempt in 1..=self.max_attempts {
            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(action = "retry_succeeded", attempt, "operation succeeded after retry");
                    }
                    return Ok((value, attempt));
                }
                Err(error) => {
                    observe(&error);
                    if attempt < self.max_attempts {
                        warn!(
                            action = "retry_scheduled",
                            attempt,
                            max_attempts = self.max_attempts,
                            wait_secs = self.wait.as_secs_f64(),
                            error = %error,
                            "attempt failed, retrying"
                        );
                        sleep(self.wait).await;
                    } else {
                        return Err(RetryExhausted {
                            last_error: error,
                            attempts: attempt,
                        });
                    }
                }
            }
        }
        unreachable!("retry loop returns from the final error branch")
    }
}

/// All attempts failed
#[derive(Debug)]
pub struct RetryExhausted<E> {
    /// The error from the final attempt
    pub last_error: E,
    /// Total attempts made
    pub attempts: u32,
}

impl<E: std::fmt::Display> std::fmt::Display for RetryExhausted<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "operation failed after {} attempts: {}",
            self.attempts, self.last_error
        )
    }
}

impl<E: std::fmt::Debug + std::fmt::Display> std::error::Error for RetryExhausted<E> {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_on_later_attempt() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::default();

        let result = policy
            .run(
                || {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n < 1 {
                            Err("transient")
                        } else {
                            Ok("done")
                        }
                    }
                },
                |_| {},
            )
            .await;

        let (value, attempts) = result.unwrap();
        assert_eq!(value, "done");
        assert_eq!(attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_reports_attempts() {
        let policy = RetryPolicy::new(3, Duration::from_secs(1));
        let observed = AtomicU32::new(0);

        let result: Result<((), u32), _> = policy
            .run(
                || async { Err::<(), _>("boom") },
                |_| {
                    observed.fetch_add(1, Ordering::SeqCst);
                },
            )
            .await;

        let exhausted = result.unwrap_err();
        assert_eq!(exhausted.attempts, 3);
        assert_eq!(observed.load(Ordering::SeqCst), 3);
        assert_eq!(
            exhausted.to_string(),
            "operation failed after 3 attempts: boom"
        );
    }

    #[tokio::test]
    async fn test_single_attempt_policy() {
        let policy = RetryPolicy::new(1, Duration::ZERO);
        let result: Result<((), u32), _> = policy.run(|| async { Err::<(), _>("no") }, |_| {}).await;
        assert_eq!(result.unwrap_err().attempts, 1);
    }
}
