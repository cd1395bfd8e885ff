// src/core/resilience/mod.rs

//! Failure containment for calls to handlers and upstream collaborators.

pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{BreakerSnapshot, CallPermit, CircuitBreakerRegistry, CircuitState};
pub use retry::{Fallback, NoopListener, RetryExecutor, RetryListener, RetryPolicy};
