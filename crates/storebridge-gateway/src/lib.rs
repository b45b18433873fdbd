//! Outbound resilience layer for the external e-commerce platform.
//!
//! Every outbound call flows through two guards, both partitioned by
//! destination (shop domain):
//!
//! - a circuit breaker that fails fast while a destination is unhealthy,
//! - a rate-limited connection scheduler that enforces the platform's
//!   call budget with priority-aware queuing under backpressure.
//!
//! [`PlatformClient`] composes both around a shared HTTP client and
//! classifies responses into the [`GatewayError`] taxonomy.

pub mod circuit_breaker;
pub mod client;
pub mod error;
pub mod scheduler;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState, CircuitStatus,
    FailureRecord,
};
pub use client::{ClientConfig, PlatformClient};
pub use error::{GatewayError, GatewayResult};
pub use scheduler::{BudgetStats, ConnectionScheduler, SchedulerConfig};
