//! Retry with exponential backoff for transient delivery failures.

use std::future::Future;
use std::time::{Duration, Instant};

/// Configuration for retry behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Upper bound on attempts, the first one included.
    pub max_attempts: u32,
    /// Wait before the second attempt; doubled for each one after.
    pub min_delay: Duration,
    /// Ceiling on any single wait.
    pub max_delay: Duration,
    /// Add up to 50% random jitter, still capped at `max_delay`.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            min_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = max.max(1);
        self
    }

    pub fn with_min_delay(mut self, delay: Duration) -> Self {
        self.min_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }
}

/// Result of a retry operation.
#[derive(Debug, Clone)]
pub struct RetryResult<T, E> {
    /// Last outcome: the success value or the final error.
    pub result: Result<T, E>,
    /// Attempts made (1 = no retries needed).
    pub attempts: u32,
    pub total_duration: Duration,
    pub succeeded: bool,
}

/// Run `operation` until it succeeds, returns an error `should_retry`
/// rejects, or `max_attempts` is reached.
pub async fn execute_with_retry_async<T, E, F, Fut, P>(
    config: &RetryConfig,
    mut operation: F,
    should_retry: P,
) -> RetryResult<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let start = Instant::now();
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match operation(attempt).await {
            Ok(value) => {
                return RetryResult {
                    result: Ok(value),
                    attempts: attempt + 1,
                    total_duration: start.elapsed(),
                    succeeded: true,
                };
            }
            Err(error) => {
                let last = attempt + 1 >= max_attempts;
                if last || !should_retry(&error) {
                    return RetryResult {
                        result: Err(error),
                        attempts: attempt + 1,
                        total_duration: start.elapsed(),
                        succeeded: false,
                    };
                }
                tokio::time::sleep(calculate_delay(config, attempt)).await;
                attempt += 1;
            }
        }
    }
}

/// Delay before retry number `attempt + 1`.
pub fn calculate_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let base = config.min_delay.as_millis() as u64;
    let cap = config.max_delay.as_millis() as u64;
    let exponential = base.saturating_mul(2_u64.saturating_pow(attempt));
    let delay = exponential.min(cap);

    if config.jitter {
        let jitter = fastrand::u64(0..=delay / 2);
        Duration::from_millis((delay + jitter).min(cap))
    } else {
        Duration::from_millis(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryConfig {
        RetryConfig::default()
            .with_min_delay(Duration::from_millis(1))
            .with_max_delay(Duration::from_millis(5))
            .with_jitter(false)
    }

    #[test]
    fn delay_doubles_and_caps() {
        let config = RetryConfig::default().with_jitter(false);
        assert_eq!(calculate_delay(&config, 0), Duration::from_secs(1));
        assert_eq!(calculate_delay(&config, 1), Duration::from_secs(2));
        assert_eq!(calculate_delay(&config, 3), Duration::from_secs(8));
        assert_eq!(calculate_delay(&config, 10), Duration::from_secs(30));
    }

    #[test]
    fn jitter_never_exceeds_cap() {
        let config = RetryConfig::default();
        for attempt in 0..12 {
            assert!(calculate_delay(&config, attempt) <= config.max_delay);
        }
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = execute_with_retry_async(
            &fast().with_max_attempts(5),
            |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 3 {
                        Err("flaky")
                    } else {
                        Ok(n)
                    }
                }
            },
            |_| true,
        )
        .await;
        assert!(result.succeeded);
        assert_eq!(result.attempts, 4);
    }

    #[tokio::test]
    async fn permanent_error_stops_immediately() {
        let result: RetryResult<(), &str> =
            execute_with_retry_async(&fast(), |_| async { Err("nope") }, |_| false).await;
        assert!(!result.succeeded);
        assert_eq!(result.attempts, 1);
    }

    #[tokio::test]
    async fn attempts_bounded_by_max() {
        let result: RetryResult<(), &str> = execute_with_retry_async(
            &fast().with_max_attempts(3),
            |_| async { Err("down") },
            |_| true,
        )
        .await;
        assert_eq!(result.attempts, 3);
        assert_eq!(result.result, Err("down"));
    }
}
