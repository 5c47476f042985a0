//! Bounded exponential backoff shared by playbook actions and alert channels.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// How many times to try an operation and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Always at least 1.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff_ms: u64, max_backoff_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff_ms,
            max_backoff_ms: max_backoff_ms.max(initial_backoff_ms),
            backoff_multiplier: 2.0,
        }
    }

    /// A policy that never retries.
    pub fn once() -> Self {
        Self::new(1, 0, 0)
    }

    /// Delay after the given zero-based failed attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_millis(base.min(self.max_backoff_ms as f64) as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, 200, 5_000)
    }
}

/// Runs `operation` until it succeeds, fails permanently, or attempts run out.
///
/// Returns the final result together with the number of attempts made.
pub async fn with_retry<F, Fut, T, E>(
    policy: &RetryPolicy,
    label: &str,
    is_retryable: impl Fn(&E) -> bool,
    operation: F,
) -> (Result<T, E>, u32)
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return (Ok(value), attempt),
            Err(e) => {
                if attempt >= max_attempts || !is_retryable(&e) {
                    return (Err(e), attempt);
                }
                let backoff = policy.backoff(attempt - 1);
                tracing::warn!(
                    operation = label,
                    attempt,
                    max = max_attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Retrying after failure"
                );
                tokio::time::sleep(backoff).await;
            }
        }
    }
}
