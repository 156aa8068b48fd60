//! Fault isolation and fallback pacing.

mod backoff;
mod circuit_breaker;

pub use backoff::{BackoffConfig, BackoffStrategy, JitterStrategy};
pub use circuit_breaker::{
    BreakerConfig, CircuitBreaker, CircuitBreakerRegistry, CircuitBreakerStats, CircuitState,
};
