//! Retry with exponential backoff and symmetric jitter.
//!
//! Stateless: it knows nothing about circuit breakers. Compose the two by
//! retrying a closure that calls [`CircuitBreaker::execute`](super::CircuitBreaker::execute),
//! or by guarding a retried operation with a breaker.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total attempts are `max_retries + 1`.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the delay added or removed at random, in `[0, ∞)`.
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            jitter_factor: 0.2,
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Non-finite or negative factors disable jitter.
    pub fn with_jitter_factor(mut self, factor: f64) -> Self {
        self.jitter_factor = if factor.is_finite() { factor.max(0.0) } else { 0.0 };
        self
    }

    /// `min(base_delay * 2^attempt, max_delay)` for the 0-indexed attempt that just failed.
    pub fn backoff(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map(|d| d.min(self.max_delay))
            .unwrap_or(self.max_delay)
    }

    /// Backoff with jitter applied; `sample` is in `[-1, 1]`. Never negative.
    pub fn jittered(&self, attempt: u32, sample: f64) -> Duration {
        let delay = self.backoff(attempt);
        if self.jitter_factor <= 0.0 {
            return delay;
        }
        let sample = sample.clamp(-1.0, 1.0);
        let nanos = delay.as_nanos() as f64 * (1.0 + self.jitter_factor * sample);
        Duration::from_nanos(nanos.max(0.0).round() as u64)
    }

    fn next_delay(&self, attempt: u32) -> Duration {
        self.jittered(attempt, fastrand::f64() * 2.0 - 1.0)
    }
}

/// Run `operation` until it succeeds or `max_retries + 1` attempts have failed.
///
/// The error of the final attempt is returned unchanged. The delay between
/// attempts suspends only the calling task.
pub async fn retry_with_backoff<T, E, F, Fut>(policy: &RetryPolicy, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let attempts = policy.max_retries.saturating_add(1);
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt + 1 >= attempts => return Err(e),
            Err(e) => {
                let delay = policy.next_delay(attempt);
                tracing::warn!(
                    attempt = attempt + 1,
                    attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::new()
            .with_base_delay(Duration::from_millis(1000))
            .with_max_delay(Duration::from_millis(5000));
        assert_eq!(policy.backoff(0), Duration::from_millis(1000));
        assert_eq!(policy.backoff(1), Duration::from_millis(2000));
        assert_eq!(policy.backoff(2), Duration::from_millis(4000));
        assert_eq!(policy.backoff(3), Duration::from_millis(5000));
        assert_eq!(policy.backoff(64), Duration::from_millis(5000));
    }

    #[test]
    fn test_jitter_bounds() {
        let policy = RetryPolicy::new().with_jitter_factor(0.2);
        assert_eq!(policy.jittered(0, 1.0), Duration::from_millis(1200));
        assert_eq!(policy.jittered(0, -1.0), Duration::from_millis(800));
        assert_eq!(policy.jittered(0, 0.0), Duration::from_millis(1000));
        // samples outside [-1, 1] are clamped
        assert_eq!(policy.jittered(0, 9.0), Duration::from_millis(1200));
    }

    #[test]
    fn test_large_jitter_never_goes_negative() {
        let policy = RetryPolicy::new().with_jitter_factor(3.0);
        assert_eq!(policy.jittered(0, -1.0), Duration::ZERO);
        assert_eq!(
            RetryPolicy::new().with_jitter_factor(f64::NAN).jitter_factor,
            0.0
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_runs_max_retries_plus_one() {
        let policy = RetryPolicy::new()
            .with_max_retries(3)
            .with_base_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(250))
            .with_jitter_factor(0.2);
        let starts = Arc::new(Mutex::new(Vec::new()));

        let err = retry_with_backoff(&policy, || {
            let starts = Arc::clone(&starts);
            async move {
                let mut starts = starts.lock().unwrap();
                starts.push(Instant::now());
                Err::<(), String>(format!("attempt {}", starts.len()))
            }
        })
        .await
        .unwrap_err();

        let starts = starts.lock().unwrap();
        assert_eq!(starts.len(), 4);
        assert_eq!(err, "attempt 4");
        let bound = policy.max_delay.mul_f64(1.0 + policy.jitter_factor);
        for pair in starts.windows(2) {
            assert!(pair[1] - pair[0] <= bound);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let policy = RetryPolicy::new().with_base_delay(Duration::from_millis(10));
        let calls = Arc::new(Mutex::new(0u32));
        let value = retry_with_backoff(&policy, || {
            let calls = Arc::clone(&calls);
            async move {
                let mut n = calls.lock().unwrap();
                *n += 1;
                if *n < 3 {
                    Err("transient")
                } else {
                    Ok(*n)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 3);
    }

    #[tokio::test]
    async fn test_zero_retries_is_single_attempt() {
        let policy = RetryPolicy::new().with_max_retries(0);
        let calls = Arc::new(Mutex::new(0u32));
        let result = retry_with_backoff(&policy, || {
            let calls = Arc::clone(&calls);
            async move {
                *calls.lock().unwrap() += 1;
                Err::<(), _>("nope")
            }
        })
        .await;
        assert_eq!(result, Err("nope"));
        assert_eq!(*calls.lock().unwrap(), 1);
    }
}
