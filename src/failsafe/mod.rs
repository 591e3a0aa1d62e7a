//! Failure isolation for backend connections

mod circuit_breaker;

pub use circuit_breaker::{Admission, CircuitBreaker, CircuitBreakerStats, CircuitState};
