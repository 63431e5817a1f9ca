//! Backoff for broker transport errors.
//!
//! Jobs themselves are never retried here: a job that fails is recorded as a
//! failure. Only broker calls that fail with a retryable
//! [`JobError`](crate::error::JobError) are attempted again.

use crate::config::RetryConfig;
use crate::error::JobsResult;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    /// Initial delay in milliseconds.
    pub initial_delay_ms: u64,

    /// Maximum delay in milliseconds.
    pub max_delay_ms: u64,

    /// Backoff multiplier.
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0).
    pub jitter_factor: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for Backoff {
    fn from(config: &RetryConfig) -> Self {
        Self {
            initial_delay_ms: config.initial_delay_ms,
            max_delay_ms: config.max_delay_ms,
            multiplier: config.multiplier.max(1.0),
            jitter_factor: 0.1,
        }
    }
}

impl Backoff {
    /// Backoff with a fixed delay and no jitter.
    pub fn fixed(delay: Duration) -> Self {
        let ms = delay.as_millis() as u64;
        Self {
            initial_delay_ms: ms,
            max_delay_ms: ms,
            multiplier: 1.0,
            jitter_factor: 0.0,
        }
    }

    /// Disables jitter.
    pub fn without_jitter(mut self) -> Self {
        self.jitter_factor = 0.0;
        self
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exp = attempt.saturating_sub(1).min(63) as i32;
        let base = (self.initial_delay_ms as f64 * self.multiplier.powi(exp)) as u64;
        let capped = base.min(self.max_delay_ms);

        let delay = if self.jitter_factor > 0.0 {
            let range = (capped as f64 * self.jitter_factor) as u64;
            capped
                .saturating_add(rand_jitter(range))
                .saturating_sub(range / 2)
        } else {
            capped
        };

        Duration::from_millis(delay)
    }
}

/// Runs `op`, retrying retryable errors up to `retries` extra times.
pub async fn with_retries<T, F, Fut>(
    operation: &str,
    retries: u32,
    backoff: &Backoff,
    mut op: F,
) -> JobsResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = JobsResult<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Err(e) if e.is_retryable() && attempt < retries => {
                attempt += 1;
                let delay = backoff.delay_for_attempt(attempt);
                warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Broker call failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            other => return other,
        }
    }
}

/// Time-seeded LCG; good enough to spread reconnect storms.
fn rand_jitter(range: u64) -> u64 {
    use std::time::SystemTime;

    if range == 0 {
        return 0;
    }

    let seed = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;

    seed.wrapping_mul(6364136223846793005)
        .wrapping_add(1442695040888963407)
        % range
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::JobError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_exponential_delays() {
        let backoff = Backoff::from(&RetryConfig {
            initial_delay_ms: 100,
            max_delay_ms: 1000,
            multiplier: 2.0,
        })
        .without_jitter();

        assert_eq!(backoff.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(backoff.delay_for_attempt(10), Duration::from_millis(1000));
    }

    #[test]
    fn test_jitter_stays_near_base() {
        let backoff = Backoff::from(&RetryConfig {
            initial_delay_ms: 1000,
            max_delay_ms: 1000,
            multiplier: 1.0,
        });
        let delay = backoff.delay_for_attempt(1).as_millis() as u64;
        assert!((950..=1050).contains(&delay));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transport_errors_only() {
        let calls = AtomicU32::new(0);
        let result: JobsResult<u32> = with_retries("submit", 2, &Backoff::fixed(Duration::from_millis(10)), || async {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 {
                Err(JobError::Transport("connection reset".into()))
            } else {
                Ok(n)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);

        let calls = AtomicU32::new(0);
        let result: JobsResult<()> = with_retries("submit", 5, &Backoff::fixed(Duration::from_millis(10)), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(JobError::DuplicateJobId("a".into()))
        })
        .await;
        assert!(matches!(result, Err(JobError::DuplicateJobId(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_retries() {
        let calls = AtomicU32::new(0);
        let result: JobsResult<()> = with_retries("put_result", 1, &Backoff::fixed(Duration::from_millis(10)), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(JobError::Transport("down".into()))
        })
        .await;
        assert!(result.unwrap_err().is_retryable());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_first_success_skips_backoff() {
        let calls = AtomicU32::new(0);
        let result = tokio_test::block_on(with_retries("submit", 3, &Backoff::default(), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, JobError>("queued")
        }));
        assert_eq!(tokio_test::assert_ok!(result), "queued");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
