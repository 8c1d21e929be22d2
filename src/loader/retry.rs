//! Retry Policy Module
//!
//! Wraps one batch fetch with a per-attempt timeout and bounded retries with
//! exponential backoff and jitter. Only transient errors are retried.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;
use crate::error::FetchError;

// == Retry Outcome ==
/// Final result of a retried operation and how many attempts it took.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, FetchError>,
    pub attempts: u32,
}

// == Retry Policy ==
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: f64,
    timeout: Option<Duration>,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig, fetch_timeout_ms: u64) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms.max(config.base_delay_ms)),
            jitter: config.jitter.clamp(0.0, 1.0),
            timeout: (fetch_timeout_ms > 0).then(|| Duration::from_millis(fetch_timeout_ms)),
        }
    }

    /// Single attempt, no timeout.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: 0.0,
            timeout: None,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    // == Backoff ==
    /// Delay to wait after failed attempt number `attempt` (1-based).
    ///
    /// `base * 2^(attempt - 1)` capped at the max delay, plus up to
    /// `jitter * delay` of random extra wait.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self
            .base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay);

        let jitter_ms = (delay.as_millis() as f64 * self.jitter) as u64;
        if jitter_ms == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
    }

    // == Run ==
    /// Runs `attempt_fn` until it succeeds, fails permanently or the attempt
    /// budget is spent. `on_retry` sees every error that is about to be retried.
    pub async fn run<T, F, Fut, R>(&self, mut attempt_fn: F, mut on_retry: R) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
        R: FnMut(u32, &FetchError),
    {
        let mut attempt = 1;
        loop {
            let result = match self.timeout {
                Some(limit) => match tokio::time::timeout(limit, attempt_fn(attempt)).await {
                    Ok(result) => result,
                    Err(_) => Err(FetchError::Timeout(limit)),
                },
                None => attempt_fn(attempt).await,
            };

            match result {
                Err(error) if error.is_transient() && attempt < self.max_attempts => {
                    on_retry(attempt, &error);
                    tokio::time::sleep(self.backoff_delay(attempt)).await;
                    attempt += 1;
                }
                result => {
                    return RetryOutcome {
                        result,
                        attempts: attempt,
                    }
                }
            }
        }
    }
}
