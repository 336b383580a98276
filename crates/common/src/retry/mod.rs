//! Bounded retry with backoff
//!
//! A [`RetryPolicy`] wraps any fallible operation, sync or async, and re-runs
//! it until it succeeds or `max_attempts` runs have failed. Delays start at
//! `delay_ms` and double after each failure when `exponential_backoff` is
//! set, never exceeding `max_delay_ms`. Only the final failure reaches the
//! caller.

use backoff::{backoff::Backoff, ExponentialBackoff, ExponentialBackoffBuilder};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::{error, warn};

/// Randomization applied to each delay when jitter is enabled
const JITTER_FACTOR: f64 = 0.25;

/// Ceiling used when exponential backoff has no configured maximum
const UNBOUNDED_DELAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Retry settings for one class of operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total runs of the operation, including the first
    pub max_attempts: u32,

    /// Delay before the second run
    pub delay_ms: u64,

    /// Double the delay after every failed run
    #[serde(default)]
    pub exponential_backoff: bool,

    /// Upper bound for the delay
    #[serde(default)]
    pub max_delay_ms: Option<u64>,

    /// Randomize each delay by +/- 25%
    #[serde(default)]
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay_ms: u64) -> Self {
        Self {
            max_attempts,
            delay_ms,
            exponential_backoff: false,
            max_delay_ms: None,
            jitter: false,
        }
    }

    pub fn exponential(mut self, max_delay_ms: Option<u64>) -> Self {
        self.exponential_backoff = true;
        self.max_delay_ms = max_delay_ms;
        self
    }

    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    /// Adapter fetches: 3 attempts, 2s doubling up to 10s
    pub fn scrape() -> Self {
        Self::new(3, 2_000).exponential(Some(10_000))
    }

    /// Broker publishes: 3 attempts, 1s doubling
    pub fn publish() -> Self {
        Self::new(3, 1_000).exponential(None)
    }

    /// Broker reconnects: 5 attempts, 5s doubling up to 30s
    pub fn reconnect() -> Self {
        Self::new(5, 5_000).exponential(Some(30_000))
    }

    fn backoff(&self) -> ExponentialBackoff {
        let initial = Duration::from_millis(self.delay_ms);
        let max_interval = match (self.exponential_backoff, self.max_delay_ms) {
            (true, Some(max)) => Duration::from_millis(max.max(self.delay_ms)),
            (true, None) => UNBOUNDED_DELAY,
            (false, _) => initial,
        };

        ExponentialBackoffBuilder::new()
            .with_initial_interval(initial)
            .with_multiplier(if self.exponential_backoff { 2.0 } else { 1.0 })
            .with_randomization_factor(if self.jitter { JITTER_FACTOR } else { 0.0 })
            .with_max_interval(max_interval)
            .with_max_elapsed_time(None)
            .build()
    }

    /// The sequence of sleeps this policy performs between runs
    pub fn delays(&self) -> Vec<Duration> {
        let mut backoff = self.backoff();
        (1..self.max_attempts.max(1))
            .filter_map(|_| backoff.next_backoff())
            .collect()
    }

    /// Run an async operation under this policy
    pub async fn retry<T, E, F, Fut>(&self, name: &str, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let attempts = AtomicU32::new(0);

        let result = backoff::future::retry_notify(
            self.backoff(),
            || {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                let fut = operation();
                async move {
                    fut.await.map_err(|e| {
                        if attempt >= max_attempts {
                            backoff::Error::permanent(e)
                        } else {
                            backoff::Error::transient(e)
                        }
                    })
                }
            },
            |err: E, delay: Duration| {
                warn!(
                    operation = name,
                    attempt = attempts.load(Ordering::SeqCst),
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Attempt failed, retrying"
                );
            },
        )
        .await;

        if let Err(ref e) = result {
            error!(operation = name, max_attempts, error = %e, "Retries exhausted");
        }
        result
    }

    /// Run a blocking operation under this policy
    pub fn retry_blocking<T, E, F>(&self, name: &str, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Result<T, E>,
        E: Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        let result = backoff::retry_notify(
            self.backoff(),
            || {
                attempt += 1;
                operation().map_err(|e| {
                    if attempt >= max_attempts {
                        backoff::Error::permanent(e)
                    } else {
                        backoff::Error::transient(e)
                    }
                })
            },
            |err: E, delay: Duration| {
                warn!(operation = name, delay_ms = delay.as_millis() as u64, error = %err, "Attempt failed, retrying");
            },
        );

        result.map_err(|e| match e {
            backoff::Error::Permanent(err) => err,
            backoff::Error::Transient { err, .. } => err,
        })
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::publish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn test_delays_double_and_cap() {
        let policy = RetryPolicy::new(5, 1_000).exponential(Some(3_000));
        let delays: Vec<u64> = policy.delays().iter().map(|d| d.as_millis() as u64).collect();
        assert_eq!(delays, vec![1_000, 2_000, 3_000, 3_000]);
    }

    #[test]
    fn test_constant_delay_without_backoff() {
        let policy = RetryPolicy::new(3, 250);
        let delays: Vec<u64> = policy.delays().iter().map(|d| d.as_millis() as u64).collect();
        assert_eq!(delays, vec![250, 250]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicUsize::new(0));
        let policy = RetryPolicy::new(3, 100).exponential(None);

        let counter = calls.clone();
        let result: Result<&str, String> = policy
            .retry("flaky", || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("boom".to_string())
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(result, Ok("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_attempts_propagate_last_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let policy = RetryPolicy::new(3, 100);

        let counter = calls.clone();
        let result: Result<(), String> = policy
            .retry("always-failing", || {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    Err(format!("failure {}", n))
                }
            })
            .await;

        assert_eq!(result, Err("failure 3".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_blocking_retry() {
        let policy = RetryPolicy::new(4, 1);
        let mut calls = 0;
        let result: Result<u32, String> = policy.retry_blocking("blocking", || {
            calls += 1;
            if calls < 4 {
                Err("not yet".into())
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result, Ok(4));
    }

    #[test]
    fn test_single_attempt_never_sleeps() {
        assert!(RetryPolicy::new(1, 5_000).delays().is_empty());
    }
}
