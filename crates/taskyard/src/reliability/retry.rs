//! Retry policy implementation

use std::fmt;
use std::future::Future;
use std::thread;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{duration_millis, option_duration_millis};

/// Configuration for retrying a unit of work
///
/// Before retry `n` (1-based) the policy waits
/// `initial_interval * backoff_coefficient^(n-1)`: with the defaults that is
/// `initial, 2x, 4x, 8x, ...`. The last attempt runs without a catch; its
/// error is returned to the caller unchanged.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use taskyard::RetryPolicy;
///
/// let policy = RetryPolicy::exponential()
///     .with_max_attempts(3)
///     .with_initial_interval(Duration::from_millis(1));
///
/// let mut calls = 0;
/// let result: Result<u32, String> = policy.execute(|| {
///     calls += 1;
///     if calls < 3 { Err(format!("attempt {calls} failed")) } else { Ok(calls) }
/// });
///
/// assert_eq!(result, Ok(3));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the initial one)
    pub max_attempts: u32,

    /// Delay before the first retry
    #[serde(with = "duration_millis")]
    pub initial_interval: Duration,

    /// Upper bound for a single delay (None = unbounded)
    #[serde(default, with = "option_duration_millis")]
    pub max_interval: Option<Duration>,

    /// Backoff multiplier (2.0 for exponential)
    pub backoff_coefficient: f64,

    /// Jitter factor (0.0-1.0)
    ///
    /// A value of 0.1 means ±10% randomness. Off by default so the delay
    /// sequence is exact.
    #[serde(default)]
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
    pub const DEFAULT_INITIAL_INTERVAL: Duration = Duration::from_millis(100);

    /// Exponential backoff: 3 attempts, 100ms initial delay, 2x coefficient, no cap, no jitter
    pub fn exponential() -> Self {
        Self {
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
            initial_interval: Self::DEFAULT_INITIAL_INTERVAL,
            max_interval: None,
            backoff_coefficient: 2.0,
            jitter: 0.0,
        }
    }

    /// A policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_interval: Duration::ZERO,
            max_interval: Some(Duration::ZERO),
            backoff_coefficient: 1.0,
            jitter: 0.0,
        }
    }

    /// Fixed intervals (no backoff)
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_interval: interval,
            max_interval: Some(interval),
            backoff_coefficient: 1.0,
            jitter: 0.0,
        }
    }

    /// Set the maximum number of attempts (at least 1)
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Set the delay before the first retry
    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    /// Cap every delay at `interval`
    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = Some(interval);
        self
    }

    /// Set the backoff coefficient (at least 1.0)
    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient.max(1.0);
        self
    }

    /// Set the jitter factor (0.0-1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Calculate delay for a given attempt number (1-based)
    ///
    /// Returns the duration to wait before that attempt starts; the first
    /// attempt never waits.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 || self.initial_interval.is_zero() {
            return Duration::ZERO;
        }

        let retry_num = attempt - 1; // First retry is after attempt 1
        let exponent = i32::try_from(retry_num - 1).unwrap_or(i32::MAX);
        let mut nanos =
            self.initial_interval.as_nanos() as f64 * self.backoff_coefficient.powi(exponent);

        // Large exponents overflow to infinity; saturate instead
        if !nanos.is_finite() {
            nanos = u64::MAX as f64;
        }

        if let Some(max) = self.max_interval {
            nanos = nanos.min(max.as_nanos() as f64);
        }

        // Apply jitter
        if self.jitter > 0.0 && nanos > 0.0 {
            let jitter_range = nanos * self.jitter;
            let jitter_offset = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
            nanos = (nanos + jitter_offset).max(0.0);
        }

        Duration::from_nanos(nanos.min(u64::MAX as f64).round() as u64)
    }

    /// Check if there are remaining attempts
    pub fn has_attempts_remaining(&self, current_attempt: u32) -> bool {
        current_attempt < self.max_attempts
    }

    /// Run `work`, retrying every failure, blocking the thread during delays
    pub fn execute<T, E, F>(&self, work: F) -> Result<T, E>
    where
        F: FnMut() -> Result<T, E>,
        E: fmt::Display,
    {
        self.execute_when(work, |_| true)
    }

    /// Run `work`, retrying failures for which `should_retry` returns true
    ///
    /// A failure the predicate rejects is returned immediately.
    pub fn execute_when<T, E, F, P>(&self, mut work: F, should_retry: P) -> Result<T, E>
    where
        F: FnMut() -> Result<T, E>,
        P: Fn(&E) -> bool,
        E: fmt::Display,
    {
        let mut attempt = 1;
        while self.has_attempts_remaining(attempt) {
            match work() {
                Ok(value) => return Ok(value),
                Err(err) if should_retry(&err) => {
                    let delay = self.delay_for_attempt(attempt + 1);
                    self.log_retry(attempt, delay, &err);
                    thread::sleep(delay);
                }
                Err(err) => {
                    debug!(attempt, error = %err, "Failure is not retryable");
                    return Err(err);
                }
            }
            attempt += 1;
        }

        // Final attempt: whatever it returns goes straight to the caller
        work()
    }

    /// Async variant of [`execute`](Self::execute); suspends during delays
    pub async fn execute_async<T, E, F, Fut>(&self, work: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        self.execute_async_when(work, |_| true).await
    }

    /// Async variant of [`execute_when`](Self::execute_when)
    pub async fn execute_async_when<T, E, F, Fut, P>(
        &self,
        mut work: F,
        should_retry: P,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: fmt::Display,
    {
        let mut attempt = 1;
        while self.has_attempts_remaining(attempt) {
            match work().await {
                Ok(value) => return Ok(value),
                Err(err) if should_retry(&err) => {
                    let delay = self.delay_for_attempt(attempt + 1);
                    self.log_retry(attempt, delay, &err);
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    debug!(attempt, error = %err, "Failure is not retryable");
                    return Err(err);
                }
            }
            attempt += 1;
        }

        work().await
    }

    fn log_retry(&self, attempt: u32, delay: Duration, err: &dyn fmt::Display) {
        warn!(
            attempt,
            max_attempts = self.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Attempt failed, retrying"
        );
    }
}

/// Retry `work` up to `max_attempts` times with exponential backoff starting at `initial_delay`
pub fn execute_with_retry<T, E, F>(
    work: F,
    max_attempts: u32,
    initial_delay: Duration,
) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
    E: fmt::Display,
{
    RetryPolicy::exponential()
        .with_max_attempts(max_attempts)
        .with_initial_interval(initial_delay)
        .execute(work)
}

/// Like [`execute_with_retry`], retrying only failures `should_retry` accepts
pub fn execute_with_retry_when<T, E, F, P>(
    work: F,
    max_attempts: u32,
    initial_delay: Duration,
    should_retry: P,
) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
    P: Fn(&E) -> bool,
    E: fmt::Display,
{
    RetryPolicy::exponential()
        .with_max_attempts(max_attempts)
        .with_initial_interval(initial_delay)
        .execute_when(work, should_retry)
}

/// Async variant of [`execute_with_retry`]
pub async fn execute_with_retry_async<T, E, F, Fut>(
    work: F,
    max_attempts: u32,
    initial_delay: Duration,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    RetryPolicy::exponential()
        .with_max_attempts(max_attempts)
        .with_initial_interval(initial_delay)
        .execute_async(work)
        .await
}

/// Async variant of [`execute_with_retry_when`]
pub async fn execute_with_retry_async_when<T, E, F, Fut, P>(
    work: F,
    max_attempts: u32,
    initial_delay: Duration,
    should_retry: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: fmt::Display,
{
    RetryPolicy::exponential()
        .with_max_attempts(max_attempts)
        .with_initial_interval(initial_delay)
        .execute_async_when(work, should_retry)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::time::Instant;

    #[derive(Debug, PartialEq, thiserror::Error)]
    enum WorkError {
        #[error("transient failure {0}")]
        Transient(u32),
        #[error("fatal failure")]
        Fatal,
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::exponential()
            .with_max_attempts(max_attempts)
            .with_initial_interval(Duration::from_millis(1))
    }

    #[test]
    fn test_exponential_defaults() {
        let policy = RetryPolicy::exponential();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_interval, Duration::from_millis(100));
        assert_eq!(policy.backoff_coefficient, 2.0);
        assert_eq!(policy.max_interval, None);
        assert_eq!(policy.jitter, 0.0);
    }

    #[test]
    fn test_no_retry() {
        let policy = RetryPolicy::no_retry();
        assert_eq!(policy.max_attempts, 1);
        assert!(!policy.has_attempts_remaining(1));
    }

    #[test]
    fn test_fixed_interval() {
        let policy = RetryPolicy::fixed(Duration::from_secs(5), 3);

        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(5));
    }

    #[test]
    fn test_delay_for_attempt() {
        let policy = RetryPolicy::exponential();

        // Attempt 1 (initial) has no delay
        assert_eq!(policy.delay_for_attempt(1), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(800));
    }

    #[test]
    fn test_max_interval_cap() {
        let policy = RetryPolicy::exponential().with_max_interval(Duration::from_millis(300));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_millis(300));
    }

    #[test]
    fn test_huge_attempt_does_not_overflow() {
        let policy = RetryPolicy::exponential();
        let delay = policy.delay_for_attempt(u32::MAX);
        assert!(delay >= Duration::from_secs(1));
    }

    #[test]
    fn test_zero_initial_interval_never_waits() {
        let policy = RetryPolicy::exponential().with_initial_interval(Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(2), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(1100), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::ZERO);
    }

    #[test]
    fn test_overflowing_backoff_respects_cap() {
        let policy = RetryPolicy::exponential().with_max_interval(Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(1100), Duration::from_secs(5));
    }

    #[test]
    fn test_many_zero_delay_attempts_finish_quickly() {
        let calls = Cell::new(0u32);
        let started = Instant::now();

        let result: Result<(), WorkError> = execute_with_retry(
            || {
                calls.set(calls.get() + 1);
                Err(WorkError::Transient(calls.get()))
            },
            2000,
            Duration::ZERO,
        );

        assert_eq!(result, Err(WorkError::Transient(2000)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy::exponential().with_jitter(0.5);
        for _ in 0..50 {
            let delay = policy.delay_for_attempt(2);
            assert!(delay >= Duration::from_millis(50));
            assert!(delay <= Duration::from_millis(150));
        }
    }

    #[test]
    fn test_builder_clamps() {
        let policy = RetryPolicy::exponential()
            .with_max_attempts(0)
            .with_backoff_coefficient(0.5)
            .with_jitter(3.0);

        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.backoff_coefficient, 1.0);
        assert_eq!(policy.jitter, 1.0);
    }

    #[test]
    fn test_execute_succeeds_first_try() {
        let calls = Cell::new(0);
        let result: Result<&str, WorkError> = fast_policy(3).execute(|| {
            calls.set(calls.get() + 1);
            Ok("done")
        });

        assert_eq!(result, Ok("done"));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_execute_retries_until_success() {
        let calls = Cell::new(0);
        let result = fast_policy(5).execute(|| {
            calls.set(calls.get() + 1);
            if calls.get() < 4 {
                Err(WorkError::Transient(calls.get()))
            } else {
                Ok(calls.get())
            }
        });

        assert_eq!(result, Ok(4));
        assert_eq!(calls.get(), 4);
    }

    #[test]
    fn test_final_attempt_error_is_returned_unchanged() {
        let calls = Cell::new(0);
        let result: Result<(), WorkError> = fast_policy(2).execute(|| {
            calls.set(calls.get() + 1);
            Err(WorkError::Transient(calls.get()))
        });

        assert_eq!(result, Err(WorkError::Transient(2)));
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_non_retryable_error_returns_immediately() {
        let calls = Cell::new(0);
        let result: Result<(), WorkError> = fast_policy(5).execute_when(
            || {
                calls.set(calls.get() + 1);
                Err(WorkError::Fatal)
            },
            |err| matches!(err, WorkError::Transient(_)),
        );

        assert_eq!(result, Err(WorkError::Fatal));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_backoff_delays_are_applied() {
        let policy = RetryPolicy::exponential()
            .with_max_attempts(3)
            .with_initial_interval(Duration::from_millis(20));
        let calls = Cell::new(0);
        let started = Instant::now();

        let result = policy.execute(|| {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(WorkError::Transient(calls.get()))
            } else {
                Ok(())
            }
        });

        assert!(result.is_ok());
        // 20ms + 40ms
        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    #[test]
    fn test_execute_with_retry_free_function() {
        let calls = Cell::new(0);
        let result = execute_with_retry(
            || {
                calls.set(calls.get() + 1);
                if calls.get() == 1 {
                    Err(WorkError::Transient(1))
                } else {
                    Ok("second")
                }
            },
            3,
            Duration::from_millis(1),
        );

        assert_eq!(result, Ok("second"));
    }

    #[test]
    fn test_execute_with_retry_when_free_function() {
        let calls = Cell::new(0);
        let result: Result<(), WorkError> = execute_with_retry_when(
            || {
                calls.set(calls.get() + 1);
                if calls.get() < 2 {
                    Err(WorkError::Transient(calls.get()))
                } else {
                    Err(WorkError::Fatal)
                }
            },
            5,
            Duration::from_millis(1),
            |err| matches!(err, WorkError::Transient(_)),
        );

        assert_eq!(result, Err(WorkError::Fatal));
        assert_eq!(calls.get(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_async_uses_backoff_sequence() {
        let calls = Cell::new(0);
        let started = tokio::time::Instant::now();

        let result = RetryPolicy::exponential()
            .with_max_attempts(4)
            .execute_async(|| {
                calls.set(calls.get() + 1);
                let attempt = calls.get();
                async move {
                    if attempt < 4 {
                        Err(WorkError::Transient(attempt))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(4));
        // 100 + 200 + 400 on the paused clock
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(700));
        assert!(elapsed < Duration::from_millis(800));
    }

    #[tokio::test]
    async fn test_execute_async_when_stops_on_rejected_error() {
        let calls = Cell::new(0);
        let result: Result<(), WorkError> = fast_policy(5)
            .execute_async_when(
                || {
                    calls.set(calls.get() + 1);
                    async { Err(WorkError::Fatal) }
                },
                |err| !matches!(err, WorkError::Fatal),
            )
            .await;

        assert_eq!(result, Err(WorkError::Fatal));
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test]
    async fn test_execute_with_retry_async_final_error() {
        let result: Result<(), WorkError> =
            execute_with_retry_async(|| async { Err(WorkError::Transient(0)) }, 2, Duration::ZERO)
                .await;
        assert_eq!(result, Err(WorkError::Transient(0)));
    }

    #[test]
    fn test_serialization() {
        let policy = RetryPolicy::exponential()
            .with_max_attempts(10)
            .with_max_interval(Duration::from_secs(2));

        let json = serde_json::to_string(&policy).unwrap();
        let parsed: RetryPolicy = serde_json::from_str(&json).unwrap();

        assert_eq!(policy, parsed);
    }
}
