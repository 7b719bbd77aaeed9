use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

/// Exponential backoff with uniform 0–1s jitter, capped at `max_delay`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1` (attempts counted from 1).
    fn delay_after(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..1000));
        (exp + jitter).min(self.max_delay)
    }

    /// Run `op` up to `max_attempts` times, sleeping between attempts.
    /// Errors for which `retryable` returns false are returned immediately.
    pub async fn run<T, E, Fut, F, R>(&self, mut op: F, retryable: R) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.max_attempts && retryable(&err) => {
                    let delay = self.delay_after(attempt);
                    warn!(
                        "retry attempt={}/{} delay_ms={} error={}",
                        attempt,
                        self.max_attempts,
                        delay.as_millis(),
                        err
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    if attempt >= self.max_attempts {
                        error!("retry exhausted attempts={} error={}", attempt, err);
                    }
                    return Err(err);
                }
            }
        }
    }
}
