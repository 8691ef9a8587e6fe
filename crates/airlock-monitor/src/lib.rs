//! Health monitoring and resilience utilities
//!
//! Atomic metrics counters with a bounded rolling error log and a
//! derived health snapshot, plus the two generic resilience helpers the
//! endpoints use for dial-like operations: a circuit breaker and a
//! jittered exponential retry policy.

mod breaker;
mod monitor;
mod retry;

pub use breaker::{BreakerError, BreakerState, CircuitBreaker};
pub use monitor::{
    AgentHealth, ErrorRecord, HealthState, HealthStatus, MetricsSnapshot, MetricsStore, Monitor,
    SessionHealth, ERROR_LOG_CAPACITY,
};
pub use retry::{retry, RetryExhausted, RetryPolicy};
