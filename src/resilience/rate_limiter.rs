use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Sliding-window rate limiter keyed per destination channel, so congestion
/// on one channel never throttles the others.
pub struct RateLimiter {
    max_calls: usize,
    period: Duration,
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(max_calls: usize, period: Duration) -> Self {
        Self {
            max_calls,
            period,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Record a call for `key` iff fewer than `max_calls` calls fall within
    /// the trailing window. Returns whether the call was admitted.
    pub async fn acquire(&self, key: &str) -> bool {
        let mut windows = self.windows.lock().await;
        let window = windows.entry(key.to_string()).or_default();
        let now = Instant::now();
        Self::evict_expired(window, now, self.period);

        if window.len() >= self.max_calls {
            debug!(
                "rate limit exceeded key={} calls={} max={}",
                key,
                window.len(),
                self.max_calls
            );
            return false;
        }
        window.push_back(now);
        true
    }

    /// Sleep just long enough for the oldest call to leave the window, then
    /// try once more. Never holds the window lock across the sleep.
    pub async fn wait_if_needed(&self, key: &str) {
        if self.acquire(key).await {
            return;
        }

        let wait = {
            let mut windows = self.windows.lock().await;
            let window = windows.entry(key.to_string()).or_default();
            let now = Instant::now();
            Self::evict_expired(window, now, self.period);
            window
                .front()
                .map(|oldest| self.period.saturating_sub(now.duration_since(*oldest)))
        };

        if let Some(wait) = wait.filter(|w| !w.is_zero()) {
            debug!("rate limit wait key={} wait_ms={}", key, wait.as_millis());
            tokio::time::sleep(wait).await;
        }
        self.acquire(key).await;
    }

    fn evict_expired(window: &mut VecDeque<Instant>, now: Instant, period: Duration) {
        while let Some(oldest) = window.front() {
            if now.duration_since(*oldest) >= period {
                window.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::Instant;

    use super::RateLimiter;

    #[tokio::test(start_paused = true)]
    async fn admits_up_to_max_calls_per_window() {
        let limiter = RateLimiter::new(3, Duration::from_secs(1));

        assert!(limiter.acquire("chan").await);
        assert!(limiter.acquire("chan").await);
        assert!(limiter.acquire("chan").await);
        assert!(!limiter.acquire("chan").await);
    }

    #[tokio::test(start_paused = true)]
    async fn admits_again_after_window_slides() {
        let limiter = RateLimiter::new(3, Duration::from_secs(1));
        for _ in 0..3 {
            assert!(limiter.acquire("chan").await);
        }
        assert!(!limiter.acquire("chan").await);

        tokio::time::advance(Duration::from_millis(1001)).await;
        assert!(limiter.acquire("chan").await);
    }

    #[tokio::test(start_paused = true)]
    async fn fourth_call_blocks_until_oldest_ages_out() {
        let limiter = RateLimiter::new(3, Duration::from_secs(1));
        for _ in 0..3 {
            limiter.wait_if_needed("chan").await;
        }

        let before = Instant::now();
        limiter.wait_if_needed("chan").await;
        let waited = Instant::now().duration_since(before);

        assert!(
            waited >= Duration::from_millis(900),
            "expected a near-full-window wait, got {waited:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_caller_parks_until_the_window_slides() {
        let limiter = RateLimiter::new(1, Duration::from_secs(1));
        assert!(limiter.acquire("chan").await);

        let mut waiting = tokio_test::task::spawn(limiter.wait_if_needed("chan"));
        tokio_test::assert_pending!(waiting.poll());

        tokio::time::advance(Duration::from_secs(1)).await;
        tokio_test::assert_ready!(waiting.poll());
    }

    #[tokio::test(start_paused = true)]
    async fn keys_are_independent() {
        let limiter = RateLimiter::new(1, Duration::from_secs(1));
        assert!(limiter.acquire("a").await);
        assert!(limiter.acquire("b").await);
        assert!(!limiter.acquire("a").await);
    }
}
