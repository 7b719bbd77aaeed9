use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub successes_required: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            successes_required: 2,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    #[error("circuit breaker is open")]
    Open,
    #[error(transparent)]
    Inner(E),
}

struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Releases the half-open probe slot when the trial call settles, including
/// when its future is dropped mid-flight.
struct ProbeSlot<'a> {
    breaker: &'a CircuitBreaker,
}

impl Drop for ProbeSlot<'_> {
    fn drop(&mut self) {
        self.breaker.inner.lock().probe_in_flight = false;
    }
}

/// Counts consecutive failures and trips open once the threshold is hit.
/// After the recovery timeout one probe call at a time is let through; the breaker
/// closes again only after enough probes succeed in a row.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.maybe_enter_half_open(&mut inner);
        inner.state
    }

    pub async fn call<T, E, Fut>(
        &self,
        op: impl FnOnce() -> Fut,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        let _probe = {
            let mut inner = self.inner.lock();
            self.maybe_enter_half_open(&mut inner);
            match inner.state {
                CircuitState::Open => return Err(CircuitBreakerError::Open),
                CircuitState::HalfOpen => {
                    // only one trial call at a time may pass while half-open
                    if inner.probe_in_flight {
                        return Err(CircuitBreakerError::Open);
                    }
                    inner.probe_in_flight = true;
                    Some(ProbeSlot { breaker: self })
                }
                CircuitState::Closed => None,
            }
        };

        match op().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(err) => {
                self.on_failure();
                Err(CircuitBreakerError::Inner(err))
            }
        }
    }

    fn maybe_enter_half_open(&self, inner: &mut BreakerInner) {
        if inner.state == CircuitState::Open {
            let elapsed = inner
                .opened_at
                .map(|at| at.elapsed() >= self.config.recovery_timeout)
                .unwrap_or(true);
            if elapsed {
                info!("circuit breaker {} entering half-open", self.name);
                inner.state = CircuitState::HalfOpen;
                inner.success_count = 0;
            }
        }
    }

    fn on_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.successes_required {
                    info!("circuit breaker {} closed after recovery", self.name);
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.opened_at = None;
                }
            }
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    warn!(
                        "circuit breaker {} opened after {} failures",
                        self.name, inner.failure_count
                    );
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                warn!("circuit breaker {} reopened by probe failure", self.name);
                inner.state = CircuitState::Open;
                inner.success_count = 0;
                inner.opened_at = Some(Instant::now());
            }
            CircuitState::Open => {}
        }
    }
}

/// Shared map of breakers keyed by operation family.
pub struct BreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn breaker_for(&self, key: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock();
        breakers
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(key, self.config.clone())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn test_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            successes_required: 2,
        }
    }

    async fn fail(breaker: &CircuitBreaker) {
        let _ = breaker
            .call(|| async { Err::<(), _>("boom") })
            .await;
    }

    async fn succeed(breaker: &CircuitBreaker) {
        let result = breaker.call(|| async { Ok::<_, &str>(()) }).await;
        assert!(result.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_failure_threshold() {
        let breaker = CircuitBreaker::new("test", test_config());
        for _ in 0..4 {
            fail(&breaker).await;
            assert_eq!(breaker.state(), CircuitState::Closed);
        }
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        let rejected = breaker.call(|| async { Ok::<_, &str>(()) }).await;
        assert!(matches!(rejected, Err(CircuitBreakerError::Open)));
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_failure_streak() {
        let breaker = CircuitBreaker::new("test", test_config());
        for _ in 0..4 {
            fail(&breaker).await;
        }
        succeed(&breaker).await;
        for _ in 0..4 {
            fail(&breaker).await;
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_through_half_open() {
        let breaker = CircuitBreaker::new("test", test_config());
        for _ in 0..5 {
            fail(&breaker).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        succeed(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        succeed(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("test", test_config());
        for _ in 0..5 {
            fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_admits_one_probe_at_a_time() {
        let breaker = Arc::new(CircuitBreaker::new("test", test_config()));
        for _ in 0..5 {
            fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        let gate = Arc::new(tokio::sync::Notify::new());
        let probe_breaker = breaker.clone();
        let probe_gate = gate.clone();
        let probe = tokio::spawn(async move {
            probe_breaker
                .call(|| async move {
                    probe_gate.notified().await;
                    Ok::<_, &str>(())
                })
                .await
        });
        tokio::task::yield_now().await;

        // a burst while the trial call is still in flight is shed
        let rejected = breaker.call(|| async { Ok::<_, &str>(()) }).await;
        assert!(matches!(rejected, Err(CircuitBreakerError::Open)));

        gate.notify_one();
        assert!(probe.await.expect("join").is_ok());

        // slot freed, the next trial call is admitted
        succeed(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn registry_returns_same_breaker_per_key() {
        let registry = BreakerRegistry::new(test_config());
        let a = registry.breaker_for("messages");
        let b = registry.breaker_for("messages");
        assert!(Arc::ptr_eq(&a, &b));

        let other = registry.breaker_for("uploads");
        assert!(!Arc::ptr_eq(&a, &other));
    }
}
