//! Bounded exponential backoff for transient failures

use log::warn;
use rand::Rng;
use shared::config::InstanceConfig;
use shared::Result;
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    pub fn from_config(config: &InstanceConfig) -> Self {
        Self::new(
            config.max_attempts,
            config.retry_base_delay,
            config.retry_max_delay,
        )
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Wait before attempt `attempt + 1`, `attempt` counting from 1.
    ///
    /// The base delay doubles per attempt, gets up to a quarter of jitter on
    /// top, and never exceeds the maximum delay.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let backoff = self
            .base_delay
            .saturating_mul(1 << exponent)
            .min(self.max_delay);

        let jitter_ms = backoff.as_millis() as u64 / 4;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        } else {
            Duration::ZERO
        };

        (backoff + jitter).min(self.max_delay)
    }

    /// Runs `operation` until it succeeds, fails with a non-retryable error,
    /// or the attempts are used up.
    pub async fn run<T, F, Fut>(&self, what: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        "{} failed (attempt {}/{}): {}, retrying in {:?}",
                        what, attempt, self.max_attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&InstanceConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::SyncError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(1), Duration::from_millis(4))
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy::new(10, Duration::from_millis(100), Duration::from_millis(1000));

        for (attempt, floor) in [(1, 100), (2, 200), (3, 400), (4, 800)] {
            let delay = policy.delay_for(attempt);
            assert!(delay >= Duration::from_millis(floor), "attempt {}", attempt);
            assert!(delay <= Duration::from_millis(floor * 5 / 4).min(Duration::from_millis(1000)));
        }
        assert_eq!(policy.delay_for(5), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(40), Duration::from_millis(1000));
    }

    #[test]
    fn test_zero_attempts_means_one() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO, Duration::ZERO).max_attempts(), 1);
    }

    #[tokio::test]
    async fn test_retries_transient_errors() {
        let calls = &AtomicU32::new(0);
        let result = fast_policy(5)
            .run("flaky", || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(SyncError::Network("timeout".to_string()))
                } else {
                    Ok(7)
                }
            })
            .await;

        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = &AtomicU32::new(0);
        let result: Result<()> = fast_policy(3)
            .run("down", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(SyncError::BridgeUnavailable("offline".to_string()))
            })
            .await;

        assert!(matches!(result, Err(SyncError::BridgeUnavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_does_not_retry_conflicts() {
        let calls = &AtomicU32::new(0);
        let result: Result<()> = fast_policy(5)
            .run("acquire", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(SyncError::LockConflict {
                    player: "bob".to_string(),
                    holder: None,
                })
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
