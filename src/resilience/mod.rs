//! Resilience primitives for talking to the vector store
//!
//! - Exponential backoff with seedable jitter
//! - Per-target circuit breakers behind an explicit registry
//! - A bounded connection pool with health eviction

pub mod backoff;
pub mod breaker;
pub mod pool;

pub use backoff::BackoffPolicy;
pub use breaker::{
    BreakerRegistry, BreakerStats, CallPermit, CircuitBreaker, CircuitState, CircuitTransition,
};
pub use pool::{Connection, ConnectionFactory, ConnectionPool, Lease, PoolStats};
