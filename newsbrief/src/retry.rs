use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::Result;

/// Exponential backoff applied to every call that talks to an external service.
///
/// Only transient errors are retried; validation and structural errors are returned on the
/// first occurrence. `max_attempts` counts the first call, so the default of 3 means one call
/// plus two retries, sleeping `base`, then `2 * base` in between.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: common::DEFAULT_RETRY_ATTEMPTS,
            base_delay: Duration::from_millis(common::DEFAULT_BACKOFF_BASE_MS),
            max_delay: Duration::from_millis(common::DEFAULT_BACKOFF_MAX_MS),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &common::Config) -> Self {
        Self {
            max_attempts: config.retry_attempts().max(1),
            base_delay: Duration::from_millis(config.backoff_base_ms()),
            max_delay: Duration::from_millis(config.backoff_max_ms()),
        }
    }

    /// Policy without sleeping between attempts
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay slept after the given failed attempt (1-based): 1s, 2s, 4s... capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Upper bound on the time spent sleeping across all attempts.
    pub fn max_total_delay(&self) -> Duration {
        (1..self.max_attempts).map(|a| self.backoff(a)).sum()
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or attempts run out.
    /// `op` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        info!("{} succeeded on attempt {}/{}", label, attempt, self.max_attempts);
                    }
                    return Ok(value);
                }
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let backoff = self.backoff(attempt);
                    warn!(
                        "{} attempt {}/{} failed: {}. Retrying in {:?}...",
                        label, attempt, self.max_attempts, e, backoff
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_transient() {
                        warn!("{} failed after {} attempts: {}", label, attempt, e);
                    }
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use std::cell::Cell;

    fn flaky(failures: u32, calls: &Cell<u32>) -> Result<&'static str> {
        calls.set(calls.get() + 1);
        if calls.get() <= failures {
            Err(PipelineError::Service(anyhow::anyhow!("503 Service Unavailable")))
        } else {
            Ok("done")
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(3),
        };
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(3), Duration::from_secs(3));
        assert_eq!(policy.max_total_delay(), Duration::from_secs(1 + 2 + 3 + 3));
    }

    #[tokio::test]
    async fn succeeds_on_third_attempt() {
        let calls = Cell::new(0);
        let counter = &calls;
        let policy = RetryPolicy::immediate(3);
        let result = policy
            .run("fetch", move |_| async move { flaky(2, counter) })
            .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = Cell::new(0);
        let counter = &calls;
        let policy = RetryPolicy::immediate(3);
        let result = policy
            .run("fetch", move |_| async move { flaky(3, counter) })
            .await;
        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test]
    async fn validation_errors_are_not_retried() {
        let calls = Cell::new(0);
        let policy = RetryPolicy::immediate(3);
        let result: Result<()> = policy
            .run("rank", |_| {
                calls.set(calls.get() + 1);
                async { Err(PipelineError::InvalidRanking("duplicate index".into())) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test]
    async fn attempt_number_is_passed_through() {
        let policy = RetryPolicy::immediate(3);
        let seen = Cell::new(Vec::new());
        let result = policy
            .run("flaky call", |attempt| {
                let mut v = seen.take();
                v.push(attempt);
                seen.set(v);
                async move {
                    if attempt < 2 {
                        Err(PipelineError::Timeout(1))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(seen.take(), vec![1, 2]);
    }
}
