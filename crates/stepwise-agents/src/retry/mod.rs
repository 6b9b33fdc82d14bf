//! Retry with exponential backoff and jitter.
//!
//! Used around model calls and available to workflow steps. The backoff
//! sleep only suspends the calling task.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use stepwise_core::config::RetryOptions;

/// Fraction of the computed delay used as the jitter range.
const JITTER_FRACTION: f64 = 0.25;

/// Details passed to `on_retry` before each backoff wait.
#[derive(Debug)]
pub struct RetryAttempt<'a, E> {
    /// 1-based number of the attempt that just failed.
    pub attempt: u32,
    /// Delay before the next attempt.
    pub delay: Duration,
    /// Error from the failed attempt.
    pub error: &'a E,
}

/// Delay before retry `attempt` (0-indexed).
///
/// `min(base × multiplier^attempt, max)`, then scaled uniformly within
/// ±25% when jitter is enabled.
#[must_use]
pub fn calculate_delay(attempt: u32, options: &RetryOptions) -> Duration {
    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    #[allow(clippy::cast_precision_loss)]
    let (base, max) = (options.base_delay_ms as f64, options.max_delay_ms as f64);

    let mut delay_ms = (base * options.backoff_multiplier.powi(exponent)).min(max);
    if !delay_ms.is_finite() {
        delay_ms = max;
    }

    if options.jitter {
        let factor = rand::thread_rng().gen_range(1.0 - JITTER_FRACTION..=1.0 + JITTER_FRACTION);
        delay_ms *= factor;
    }

    Duration::from_secs_f64(delay_ms.max(0.0) / 1000.0)
}

type RetryPredicate<E> = Box<dyn Fn(&E) -> bool + Send + Sync>;
type RetryObserver<E> = Box<dyn Fn(&RetryAttempt<'_, E>) + Send + Sync>;

/// Retry policy for a fallible async operation.
pub struct RetryPolicy<E> {
    options: RetryOptions,
    retry_if: RetryPredicate<E>,
    on_retry: Option<RetryObserver<E>>,
}

impl<E> RetryPolicy<E> {
    /// Create a policy that retries every error.
    #[must_use]
    pub fn new(options: RetryOptions) -> Self {
        Self {
            options,
            retry_if: Box::new(|_| true),
            on_retry: None,
        }
    }

    /// Only retry errors for which `predicate` returns true.
    ///
    /// A non-retryable error is returned after the attempt that produced
    /// it, without consuming a retry.
    #[must_use]
    pub fn retry_if(mut self, predicate: impl Fn(&E) -> bool + Send + Sync + 'static) -> Self {
        self.retry_if = Box::new(predicate);
        self
    }

    /// Observe each retry before its backoff wait.
    #[must_use]
    pub fn on_retry(
        mut self,
        observer: impl Fn(&RetryAttempt<'_, E>) + Send + Sync + 'static,
    ) -> Self {
        self.on_retry = Some(Box::new(observer));
        self
    }

    /// Retry options in effect.
    #[must_use]
    pub const fn options(&self) -> &RetryOptions {
        &self.options
    }

    /// Run `operation` until it succeeds, fails non-retryably, or
    /// `max_retries` retries are used up.
    ///
    /// # Errors
    ///
    /// Returns the most recent error once retrying stops.
    pub async fn run<T, F, Fut>(&self, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut retries = 0u32;

        loop {
            let error = match operation().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if retries >= self.options.max_retries || !(self.retry_if)(&error) {
                return Err(error);
            }

            let delay = calculate_delay(retries, &self.options);
            if let Some(observer) = &self.on_retry {
                observer(&RetryAttempt {
                    attempt: retries + 1,
                    delay,
                    error: &error,
                });
            }
            tracing::warn!(
                attempt = retries + 1,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Operation failed, retrying"
            );

            tokio::time::sleep(delay).await;
            retries += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    fn fixed(max_retries: u32) -> RetryOptions {
        RetryOptions {
            max_retries,
            jitter: false,
            ..RetryOptions::default()
        }
    }

    #[test]
    fn test_delay_without_jitter() {
        let options = fixed(3);
        assert_eq!(calculate_delay(0, &options), Duration::from_millis(1000));
        assert_eq!(calculate_delay(1, &options), Duration::from_millis(2000));
        assert_eq!(calculate_delay(3, &options), Duration::from_millis(8000));
        assert_eq!(calculate_delay(10, &options), Duration::from_millis(30_000));
        assert_eq!(calculate_delay(u32::MAX, &options), Duration::from_millis(30_000));
    }

    #[test]
    fn test_delay_respects_custom_cap() {
        let options = RetryOptions {
            max_delay_ms: 5_000,
            ..fixed(3)
        };
        assert_eq!(calculate_delay(3, &options), Duration::from_millis(5_000));
    }

    #[test]
    fn test_jitter_within_bounds() {
        let options = RetryOptions {
            jitter: true,
            ..fixed(3)
        };
        for _ in 0..200 {
            let delay = calculate_delay(1, &options);
            assert!(delay >= Duration::from_millis(1500), "{delay:?}");
            assert!(delay <= Duration::from_millis(2500), "{delay:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy::new(fixed(3));

        let result: Result<u32, &str> = policy
            .run(|| {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move { if n < 2 { Err("busy") } else { Ok(n) } }
            })
            .await;

        assert_eq!(result, Ok(2));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_returns_last_error() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy::new(fixed(2));

        let result: Result<(), u32> = policy
            .run(|| {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move { Err(n) }
            })
            .await;

        assert_eq!(result, Err(2));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_runs_once() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy::<&str>::new(fixed(5)).retry_if(|e| *e != "fatal");

        let result: Result<(), &str> = policy
            .run(|| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err("fatal") }
            })
            .await;

        assert_eq!(result, Err("fatal"));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_retry_sees_each_wait() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&seen);
        let policy = RetryPolicy::<&'static str>::new(fixed(2)).on_retry(move |a| {
            recorder.lock().unwrap().push((a.attempt, a.delay, *a.error));
        });

        let start = tokio::time::Instant::now();
        let _: Result<(), &str> = policy.run(|| async { Err("down") }).await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                (1, Duration::from_millis(1000), "down"),
                (2, Duration::from_millis(2000), "down"),
            ]
        );
        assert!(start.elapsed() >= Duration::from_millis(3000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_retry_options() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy::new(RetryOptions::no_retry());
        let _: Result<(), ()> = policy
            .run(|| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(()) }
            })
            .await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
