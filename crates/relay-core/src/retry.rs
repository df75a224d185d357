// retry.rs - Bounded exponential backoff.
//
// Both dependency clients (metadata store, workflow engine) retry transient
// failures with the same policy shape. The policy owns the loop so the
// attempt count and the final error are reported consistently.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry settings, read from `[metadata.retry]` / `[workflow.retry]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one. `1` disables retries.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    200
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_multiplier() -> f64 {
    2.0
}

/// A successful result and how many attempts it took.
#[derive(Debug, Clone, PartialEq)]
pub struct Attempted<T> {
    pub value: T,
    pub attempts: u32,
}

/// The error that ended a retry loop.
#[derive(Debug, Clone, PartialEq)]
pub struct Exhausted<E> {
    pub error: E,
    pub attempts: u32,
    /// True if the last error was transient (the loop ran out of attempts),
    /// false if a permanent error stopped it early.
    pub transient: bool,
}

impl RetryPolicy {
    /// A policy with no delay between attempts. Used by tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
            multiplier: 1.0,
        }
    }

    /// Delay before attempt `attempt + 1`, where `attempt` starts at 1.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let millis = self.initial_backoff_ms as f64 * self.multiplier.max(1.0).powi(exp);
        let capped = millis.min(self.max_backoff_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    /// Run `op` until it succeeds, returns a non-transient error, or the
    /// attempt budget is spent. `op` receives the 1-based attempt number.
    pub async fn run<T, E, F, Fut, C>(&self, mut op: F, is_transient: C) -> Result<Attempted<T>, Exhausted<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let max = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(Attempted { value, attempts: attempt }),
                Err(error) => {
                    let transient = is_transient(&error);
                    if !transient || attempt >= max {
                        return Err(Exhausted {
                            error,
                            attempts: attempt,
                            transient,
                        });
                    }
                    let delay = self.backoff(attempt);
                    tracing::debug!(attempt, ?delay, error = %error, "transient failure, backing off");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
            multiplier: 2.0,
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(5), Duration::from_millis(1_000));
        assert_eq!(policy.backoff(30), Duration::from_millis(1_000));
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let result = RetryPolicy::immediate(3)
            .run(
                move |_| async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("busy".to_string())
                    } else {
                        Ok(7)
                    }
                },
                |_| true,
            )
            .await
            .unwrap();
        assert_eq!(result, Attempted { value: 7, attempts: 3 });
    }

    #[tokio::test]
    async fn stops_at_the_bound() {
        let result: Result<Attempted<()>, _> = RetryPolicy::immediate(4)
            .run(|_| async { Err("down".to_string()) }, |_| true)
            .await;
        let exhausted = result.unwrap_err();
        assert_eq!(exhausted.attempts, 4);
        assert!(exhausted.transient);
    }

    #[tokio::test]
    async fn permanent_errors_stop_immediately() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<Attempted<()>, _> = RetryPolicy::immediate(5)
            .run(
                move |_| async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err("rejected".to_string())
                },
                |_| false,
            )
            .await;
        let exhausted = result.unwrap_err();
        assert_eq!(exhausted.attempts, 1);
        assert!(!exhausted.transient);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
