//! Circuit breaker for outbound platform calls.
//!
//! Tracks consecutive failures per destination and temporarily fails fast
//! once a destination has exceeded the failure threshold. Circuits are
//! keyed per destination so one shop's outage never blocks calls to
//! another.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use storebridge_core::Destination;

use crate::error::{GatewayError, GatewayResult};

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - calls proceed.
    #[default]
    Closed,
    /// Circuit tripped - calls rejected immediately.
    Open,
    /// Testing recovery - probe calls allowed through.
    HalfOpen,
}

impl CircuitState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "closed" => Some(Self::Closed),
            "open" => Some(Self::Open),
            "half_open" => Some(Self::HalfOpen),
            _ => None,
        }
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit.
    pub failure_threshold: u32,
    /// Duration the circuit stays open before admitting a probe.
    pub reset_timeout: Duration,
    /// Consecutive half-open successes required to close the circuit.
    pub half_open_success_threshold: u32,
    /// Maximum number of recent failures to retain for diagnostics.
    pub max_failure_history: usize,
    /// Idle circuits older than this are pruned from the registry.
    pub idle_retention: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            half_open_success_threshold: 2,
            max_failure_history: 10,
            idle_retention: Duration::from_secs(3600),
        }
    }
}

impl CircuitBreakerConfig {
    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_half_open_success_threshold(mut self, threshold: u32) -> Self {
        self.half_open_success_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_max_failure_history(mut self, size: usize) -> Self {
        self.max_failure_history = size;
        self
    }

    #[must_use]
    pub fn with_idle_retention(mut self, retention: Duration) -> Self {
        self.idle_retention = retention;
        self
    }
}

/// Record of a single call failure for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub timestamp: DateTime<Utc>,
    pub error: String,
    pub response_code: Option<u16>,
    pub latency_ms: Option<u32>,
}

impl FailureRecord {
    #[must_use]
    pub fn new(error: String, response_code: Option<u16>, latency_ms: Option<u32>) -> Self {
        Self {
            timestamp: Utc::now(),
            error,
            response_code,
            latency_ms,
        }
    }
}

/// Circuit breaker for a single destination.
#[derive(Debug)]
pub struct CircuitBreaker {
    destination: Destination,
    config: CircuitBreakerConfig,
    state: CircuitState,
    failure_count: u32,
    half_open_successes: u32,
    recent_failures: Vec<FailureRecord>,
    last_failure_at: Option<DateTime<Utc>>,
    last_success_at: Option<DateTime<Utc>>,
    opened_at: Option<DateTime<Utc>>,
    last_touched_at: DateTime<Utc>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker in the closed state.
    #[must_use]
    pub fn new(destination: Destination, config: CircuitBreakerConfig) -> Self {
        Self {
            destination,
            config,
            state: CircuitState::Closed,
            failure_count: 0,
            half_open_successes: 0,
            recent_failures: Vec::new(),
            last_failure_at: None,
            last_success_at: None,
            opened_at: None,
            last_touched_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.state
    }

    #[must_use]
    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    #[must_use]
    pub fn recent_failures(&self) -> &[FailureRecord] {
        &self.recent_failures
    }

    /// When the open circuit will next admit a probe, if open.
    #[must_use]
    pub fn next_attempt_at(&self) -> Option<DateTime<Utc>> {
        self.opened_at.map(|t| {
            t + chrono::Duration::from_std(self.config.reset_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(30))
        })
    }

    /// Check whether a call may proceed.
    ///
    /// Handles the automatic Open -> HalfOpen transition once the reset
    /// timeout has elapsed. Returns the earliest retry time when rejected.
    pub fn can_execute(&mut self) -> Result<(), DateTime<Utc>> {
        self.last_touched_at = Utc::now();
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let retry_at = self.next_attempt_at().unwrap_or_else(Utc::now);
                if Utc::now() >= retry_at {
                    self.state = CircuitState::HalfOpen;
                    self.half_open_successes = 0;
                    tracing::info!(
                        target: "circuit_breaker",
                        destination = %self.destination,
                        "Circuit transitioning to half-open for probe"
                    );
                    Ok(())
                } else {
                    Err(retry_at)
                }
            }
        }
    }

    /// Record a successful call.
    ///
    /// Resets the failure count when closed; counts probe successes when
    /// half-open and closes the circuit once enough have accumulated.
    pub fn record_success(&mut self) {
        self.last_success_at = Some(Utc::now());
        self.last_touched_at = Utc::now();

        match self.state {
            CircuitState::Closed => {
                self.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                self.half_open_successes += 1;
                if self.half_open_successes >= self.config.half_open_success_threshold {
                    self.state = CircuitState::Closed;
                    self.failure_count = 0;
                    self.half_open_successes = 0;
                    self.recent_failures.clear();
                    self.opened_at = None;
                    tracing::info!(
                        target: "circuit_breaker",
                        destination = %self.destination,
                        "Circuit closed after successful probes"
                    );
                }
            }
            CircuitState::Open => {
                tracing::warn!(
                    target: "circuit_breaker",
                    destination = %self.destination,
                    "Unexpected success recorded while circuit is open"
                );
            }
        }
    }

    /// Record a call failure.
    ///
    /// Opens the circuit at the failure threshold; any half-open failure
    /// reopens it immediately with a fresh reset window.
    pub fn record_failure(&mut self, failure: FailureRecord) {
        self.last_failure_at = Some(Utc::now());
        self.last_touched_at = Utc::now();
        self.failure_count += 1;

        self.recent_failures.push(failure);
        while self.recent_failures.len() > self.config.max_failure_history {
            self.recent_failures.remove(0);
        }

        match self.state {
            CircuitState::Closed => {
                if self.failure_count >= self.config.failure_threshold {
                    self.state = CircuitState::Open;
                    self.opened_at = Some(Utc::now());
                    tracing::warn!(
                        target: "circuit_breaker",
                        destination = %self.destination,
                        failure_count = self.failure_count,
                        threshold = self.config.failure_threshold,
                        "Circuit opened due to consecutive failures"
                    );
                }
            }
            CircuitState::HalfOpen => {
                self.state = CircuitState::Open;
                self.opened_at = Some(Utc::now());
                self.half_open_successes = 0;
                tracing::warn!(
                    target: "circuit_breaker",
                    destination = %self.destination,
                    "Circuit reopened after failed probe"
                );
            }
            CircuitState::Open => {}
        }
    }

    fn is_idle_since(&self, cutoff: DateTime<Utc>) -> bool {
        self.state == CircuitState::Closed && self.last_touched_at < cutoff
    }
}

/// Status snapshot of a circuit breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitStatus {
    pub destination: Destination,
    pub state: CircuitState,
    pub failure_count: u32,
    pub half_open_successes: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub recent_failures: Vec<FailureRecord>,
}

impl From<&CircuitBreaker> for CircuitStatus {
    fn from(cb: &CircuitBreaker) -> Self {
        Self {
            destination: cb.destination.clone(),
            state: cb.state,
            failure_count: cb.failure_count,
            half_open_successes: cb.half_open_successes,
            last_failure_at: cb.last_failure_at,
            last_success_at: cb.last_success_at,
            next_attempt_at: cb.next_attempt_at(),
            recent_failures: cb.recent_failures.clone(),
        }
    }
}

/// Registry managing circuit breakers across all destinations.
#[derive(Clone)]
pub struct CircuitBreakerRegistry {
    breakers: Arc<RwLock<HashMap<Destination, CircuitBreaker>>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    /// Run `operation` under circuit protection for `destination`.
    ///
    /// Fails fast with [`GatewayError::CircuitOpen`] without invoking the
    /// operation while the circuit rejects. Rate-limit errors are excluded
    /// from failure accounting (they reflect pacing, not health).
    pub async fn execute<T, F, Fut>(
        &self,
        destination: &Destination,
        operation: F,
    ) -> GatewayResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        self.check(destination).await?;

        match operation().await {
            Ok(value) => {
                self.record_success(destination).await;
                Ok(value)
            }
            Err(err) => {
                if err.counts_toward_circuit() {
                    let (code, message) = match &err {
                        GatewayError::Permanent {
                            status, message, ..
                        } => (Some(*status), message.clone()),
                        other => (None, other.to_string()),
                    };
                    self.record_failure(destination, FailureRecord::new(message, code, None))
                        .await;
                }
                Err(err)
            }
        }
    }

    /// Check whether a call to `destination` may proceed.
    pub async fn check(&self, destination: &Destination) -> GatewayResult<()> {
        let mut breakers = self.breakers.write().await;
        let cb = breakers
            .entry(destination.clone())
            .or_insert_with(|| CircuitBreaker::new(destination.clone(), self.config.clone()));

        cb.can_execute()
            .map_err(|retry_at| GatewayError::CircuitOpen {
                destination: destination.clone(),
                retry_at,
            })
    }

    /// Record a successful call for a destination.
    pub async fn record_success(&self, destination: &Destination) {
        let mut breakers = self.breakers.write().await;
        if let Some(cb) = breakers.get_mut(destination) {
            cb.record_success();
        }
    }

    /// Record a failed call for a destination.
    pub async fn record_failure(&self, destination: &Destination, failure: FailureRecord) {
        let mut breakers = self.breakers.write().await;
        let cb = breakers
            .entry(destination.clone())
            .or_insert_with(|| CircuitBreaker::new(destination.clone(), self.config.clone()));
        cb.record_failure(failure);
    }

    /// Status snapshot for one destination, if a circuit exists.
    pub async fn status(&self, destination: &Destination) -> Option<CircuitStatus> {
        let breakers = self.breakers.read().await;
        breakers.get(destination).map(CircuitStatus::from)
    }

    /// Status snapshots for every tracked destination.
    pub async fn all_statuses(&self) -> Vec<CircuitStatus> {
        let breakers = self.breakers.read().await;
        breakers.values().map(CircuitStatus::from).collect()
    }

    /// Drop closed circuits that have been idle past the retention period.
    ///
    /// Returns the number of circuits pruned. Open and half-open circuits
    /// are always kept.
    pub async fn prune_idle(&self) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.idle_retention)
                .unwrap_or_else(|_| chrono::Duration::hours(1));

        let mut breakers = self.breakers.write().await;
        let before = breakers.len();
        breakers.retain(|_, cb| !cb.is_idle_since(cutoff));
        let pruned = before - breakers.len();
        if pruned > 0 {
            tracing::debug!(
                target: "circuit_breaker",
                pruned,
                remaining = breakers.len(),
                "Pruned idle circuit records"
            );
        }
        pruned
    }

    /// Remove a destination's circuit entirely.
    pub async fn remove(&self, destination: &Destination) {
        let mut breakers = self.breakers.write().await;
        breakers.remove(destination);
    }

    /// Spawn the periodic prune sweep.
    ///
    /// The task exits once every other handle to this registry has been
    /// dropped. Must be called inside a tokio runtime.
    pub fn spawn_prune_sweep(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let weak = Arc::downgrade(&self.breakers);
        let config = self.config.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let Some(breakers) = weak.upgrade() else {
                    break;
                };
                let registry = CircuitBreakerRegistry {
                    breakers,
                    config: config.clone(),
                };
                registry.prune_idle().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dest() -> Destination {
        Destination::new("shop.example.com")
    }

    fn fail(msg: &str) -> FailureRecord {
        FailureRecord::new(msg.to_string(), Some(503), Some(120))
    }

    #[test]
    fn test_circuit_state_round_trip() {
        for state in [CircuitState::Closed, CircuitState::Open, CircuitState::HalfOpen] {
            assert_eq!(CircuitState::parse(state.as_str()), Some(state));
        }
        assert_eq!(CircuitState::parse("bogus"), None);
    }

    #[test]
    fn test_config_builder() {
        let config = CircuitBreakerConfig::default()
            .with_failure_threshold(3)
            .with_reset_timeout(Duration::from_secs(60))
            .with_half_open_success_threshold(4)
            .with_max_failure_history(2);
        assert_eq!(config.failure_threshold, 3);
        assert_eq!(config.reset_timeout, Duration::from_secs(60));
        assert_eq!(config.half_open_success_threshold, 4);
        assert_eq!(config.max_failure_history, 2);
    }

    #[test]
    fn test_new_breaker_is_closed() {
        let mut cb = CircuitBreaker::new(dest(), CircuitBreakerConfig::default());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.can_execute().is_ok());
    }

    #[test]
    fn test_opens_after_threshold() {
        let config = CircuitBreakerConfig::default().with_failure_threshold(3);
        let mut cb = CircuitBreaker::new(dest(), config);

        for i in 0..3 {
            cb.record_failure(fail(&format!("error {i}")));
        }

        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.failure_count(), 3);
        assert!(cb.can_execute().is_err());
        assert!(cb.next_attempt_at().is_some());
    }

    #[test]
    fn test_success_resets_count_when_closed() {
        let config = CircuitBreakerConfig::default().with_failure_threshold(5);
        let mut cb = CircuitBreaker::new(dest(), config);

        cb.record_failure(fail("one"));
        cb.record_failure(fail("two"));
        assert_eq!(cb.failure_count(), 2);

        cb.record_success();
        assert_eq!(cb.failure_count(), 0);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_open_transitions_to_half_open_after_timeout() {
        let config = CircuitBreakerConfig::default()
            .with_failure_threshold(1)
            .with_reset_timeout(Duration::from_millis(0));
        let mut cb = CircuitBreaker::new(dest(), config);

        cb.record_failure(fail("boom"));
        assert_eq!(cb.state(), CircuitState::Open);

        // Zero reset timeout: the next check admits a probe.
        assert!(cb.can_execute().is_ok());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_half_open_requires_consecutive_successes() {
        let config = CircuitBreakerConfig::default()
            .with_failure_threshold(1)
            .with_reset_timeout(Duration::from_millis(0))
            .with_half_open_success_threshold(2);
        let mut cb = CircuitBreaker::new(dest(), config);

        cb.record_failure(fail("boom"));
        assert!(cb.can_execute().is_ok()); // now half-open

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let config = CircuitBreakerConfig::default()
            .with_failure_threshold(1)
            .with_reset_timeout(Duration::from_millis(0));
        let mut cb = CircuitBreaker::new(dest(), config);

        cb.record_failure(fail("boom"));
        assert!(cb.can_execute().is_ok()); // half-open probe admitted

        cb.record_failure(fail("probe failed"));
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_failure_history_bounded() {
        let config = CircuitBreakerConfig::default()
            .with_failure_threshold(100)
            .with_max_failure_history(3);
        let mut cb = CircuitBreaker::new(dest(), config);

        for i in 0..10 {
            cb.record_failure(fail(&format!("error {i}")));
        }

        assert_eq!(cb.recent_failures().len(), 3);
        assert_eq!(cb.recent_failures()[0].error, "error 7");
        assert_eq!(cb.recent_failures()[2].error, "error 9");
    }

    #[tokio::test]
    async fn test_registry_execute_records_success() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig::default());
        let d = dest();

        let result: GatewayResult<u32> = registry.execute(&d, || async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);

        let status = registry.status(&d).await.unwrap();
        assert_eq!(status.state, CircuitState::Closed);
        assert!(status.last_success_at.is_some());
    }

    #[tokio::test]
    async fn test_registry_fails_fast_without_invoking_operation() {
        let config = CircuitBreakerConfig::default()
            .with_failure_threshold(1)
            .with_reset_timeout(Duration::from_secs(60));
        let registry = CircuitBreakerRegistry::new(config);
        let d = dest();

        registry
            .record_failure(&d, fail("unreachable"))
            .await;

        let mut invoked = false;
        let result: GatewayResult<()> = registry
            .execute(&d, || {
                invoked = true;
                async { Ok(()) }
            })
            .await;

        assert!(matches!(result, Err(GatewayError::CircuitOpen { .. })));
        assert!(!invoked, "operation must not run while circuit is open");
    }

    #[tokio::test]
    async fn test_registry_excludes_rate_limits_from_accounting() {
        let config = CircuitBreakerConfig::default().with_failure_threshold(1);
        let registry = CircuitBreakerRegistry::new(config);
        let d = dest();

        let result: GatewayResult<()> = registry
            .execute(&d, || async {
                Err(GatewayError::RateLimited {
                    destination: Destination::new("shop.example.com"),
                    correlation: "job-9".into(),
                    retry_after: None,
                })
            })
            .await;
        assert!(matches!(result, Err(GatewayError::RateLimited { .. })));

        let status = registry.status(&d).await.unwrap();
        assert_eq!(status.state, CircuitState::Closed);
        assert_eq!(status.failure_count, 0);
    }

    #[tokio::test]
    async fn test_registry_isolates_destinations() {
        let config = CircuitBreakerConfig::default().with_failure_threshold(1);
        let registry = CircuitBreakerRegistry::new(config);
        let sick = Destination::new("sick.example.com");
        let healthy = Destination::new("healthy.example.com");

        registry.record_failure(&sick, fail("down")).await;

        assert!(registry.check(&sick).await.is_err());
        assert!(registry.check(&healthy).await.is_ok());
    }

    #[tokio::test]
    async fn test_spawn_prune_sweep_runs_and_stops() {
        let config = CircuitBreakerConfig::default().with_idle_retention(Duration::from_secs(0));
        let registry = CircuitBreakerRegistry::new(config);
        let idle = Destination::new("idle.example.com");
        let _ = registry.check(&idle).await;

        let handle = registry.spawn_prune_sweep(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(registry.status(&idle).await.is_none());

        // Dropping the last registry handle ends the sweep task.
        drop(registry);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweep task should stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_prune_idle_keeps_open_circuits() {
        let config = CircuitBreakerConfig::default()
            .with_failure_threshold(1)
            .with_idle_retention(Duration::from_secs(0));
        let registry = CircuitBreakerRegistry::new(config);

        let open = Destination::new("open.example.com");
        let idle = Destination::new("idle.example.com");

        registry.record_failure(&open, fail("down")).await;
        registry.record_success(&idle).await; // no-op, circuit absent
        let _ = registry.check(&idle).await; // creates a closed circuit

        // Zero retention: every closed circuit is immediately idle.
        tokio::time::sleep(Duration::from_millis(5)).await;
        registry.prune_idle().await;

        assert!(registry.status(&open).await.is_some());
        assert!(registry.status(&idle).await.is_none());
    }
}
