//! Bounded exponential-backoff retries for flaky operations.
//!
//! Renames and deletes under the cache root can fail transiently while other
//! tools (indexers, virus scanners, a concurrent `git gc`) hold files open, and
//! fetches fail on network hiccups. Callers wrap those operations in [`retry`]
//! with a predicate selecting which errors are worth another attempt.

use std::fmt;
use std::thread;
use std::time::Duration;

/// Attempt budget and sleep schedule for [`retry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first.
    pub attempts: u32,
    /// Sleep before the second attempt; doubles after every failure.
    pub base_sleep: Duration,
    /// Upper bound for a single sleep.
    pub max_sleep: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(10, Duration::from_millis(250))
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, base_sleep: Duration) -> Self {
        Self {
            attempts,
            base_sleep,
            max_sleep: None,
        }
    }

    /// Run the operation exactly once.
    #[cfg(test)]
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Cap every sleep to a quarter of an overall timeout.
    pub fn capped_to(mut self, timeout: Duration) -> Self {
        self.max_sleep = Some(timeout / 4);
        self
    }

    /// Sleep after the failure of attempt `attempt` (zero-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = 2u32
            .checked_pow(attempt)
            .and_then(|factor| self.base_sleep.checked_mul(factor))
            .unwrap_or(Duration::MAX);
        match self.max_sleep {
            Some(max) => delay.min(max),
            None => delay,
        }
    }
}

/// Invoke `op` until it succeeds, fails with an error `is_retryable` rejects,
/// or the attempt budget is spent.
///
/// The last error is returned unmodified.
pub fn retry<T, E, F, P>(policy: &RetryPolicy, name: &str, mut op: F, is_retryable: P) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
    P: Fn(&E) -> bool,
    E: fmt::Display,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 0;

    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if attempt + 1 < attempts && is_retryable(&err) => {
                let delay = policy.delay(attempt);
                log::warn!(
                    "{}: attempt {} of {} failed: {}; retrying in {:.2}s",
                    name,
                    attempt + 1,
                    attempts,
                    err,
                    delay.as_secs_f64()
                );
                thread::sleep(delay);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Retry predicate accepting every error.
pub fn any_error<E>(_: &E) -> bool {
    true
}
