pub use self::circuit_breaker::{
    BreakerRegistry, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState,
};
pub use self::rate_limiter::RateLimiter;
pub use self::retry::RetryPolicy;

pub mod circuit_breaker;
pub mod rate_limiter;
pub mod retry;
