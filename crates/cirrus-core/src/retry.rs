use cirrus_provider::ProviderError;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Bounded exponential backoff for transient provider errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Policy with no retries and no delay.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt + 1` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails permanently, or runs out of
    /// attempts. Each attempt is bounded by `timeout`; an elapsed timeout
    /// counts as a transient error. Returns the result and the number of
    /// attempts made. Exhausted transient errors come back permanent.
    pub async fn run<T, F, Fut>(&self, timeout: Duration, mut op: F) -> (Result<T, ProviderError>, u32)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match tokio::time::timeout(timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Transient(format!(
                    "operation timed out after {}s",
                    timeout.as_secs_f64()
                ))),
            };
            match result {
                Ok(value) => return (Ok(value), attempt),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = self.delay_for_attempt(attempt - 1);
                    debug!("attempt {attempt}/{max_attempts} failed: {e}; retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return (Err(e.into_permanent()), attempt),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[test]
    fn delay_grows_and_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let (result, attempts) = fast(5)
            .run(Duration::from_secs(1), move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ProviderError::Transient("throttled".into()))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let (result, attempts) = fast(5)
            .run(Duration::from_secs(1), || async {
                Err::<(), _>(ProviderError::Permanent("denied".into()))
            })
            .await;
        assert_eq!(result.unwrap_err(), ProviderError::Permanent("denied".into()));
        assert_eq!(attempts, 1);
    }

    #[tokio::test]
    async fn exhausted_transient_becomes_permanent() {
        let (result, attempts) = fast(3)
            .run(Duration::from_secs(1), || async {
                Err::<(), _>(ProviderError::Transient("throttled".into()))
            })
            .await;
        assert_eq!(result.unwrap_err(), ProviderError::Permanent("throttled".into()));
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn timeout_counts_as_transient() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let (result, attempts) = fast(2)
            .run(Duration::from_millis(20), move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
                Ok("done")
            })
            .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(attempts, 2);
    }
}
