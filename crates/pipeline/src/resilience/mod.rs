//! Guarded execution with retry, timeout, bulkhead and circuit breaker, and
//! reporting of every execution to resilience observers.

mod behavior;
mod context;
mod policy;

pub use behavior::ResilienceBehavior;
pub use context::{
    LoggingResilienceObserver, MetricsResilienceObserver, ResilienceContext, ResilienceObserver,
};
pub use policy::{CircuitBreakerConfig, GuardError, ResiliencePolicy, RetryConfig};
