//! Fault handling: per-agent circuit breakers and the task retry policy.

mod breaker;
mod retry;

pub use breaker::{BreakerSettings, CircuitBreaker};
pub use retry::{FailureOutcome, FaultHandler};
