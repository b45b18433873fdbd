//! Rate-limited connection scheduler.
//!
//! Enforces the platform's per-destination call budget: a rolling window
//! of `max_calls` per `window`. Calls that fit the budget are admitted
//! immediately; the rest park in a pending queue ordered by priority tier
//! then arrival, and are released by a pump task when the window resets,
//! a response reveals more quota, or a throttle expires.
//!
//! Admission within one destination is strict-priority-then-FIFO. A
//! saturated high-priority stream can therefore starve lower tiers
//! indefinitely; that is an accepted limitation, not a bug.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, Mutex};

use storebridge_core::{Destination, Priority};

use crate::error::{GatewayError, GatewayResult};

/// Configuration for the connection scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Calls permitted per window for a destination that has not reported
    /// its own limits yet.
    pub max_calls: u32,
    /// Budget window length.
    pub window: Duration,
    /// How often the pump releases queued waiters.
    pub pump_interval: Duration,
    /// Estimated budget drain rate (calls per second) used to project the
    /// reset time from a reported quota.
    pub drain_per_second: f64,
    /// Throttle duration applied on a 429 without a retry-after hint.
    pub default_throttle: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            // Platform default: 40-call leaky bucket over 20 seconds.
            max_calls: 40,
            window: Duration::from_secs(20),
            pump_interval: Duration::from_millis(50),
            drain_per_second: 2.0,
            default_throttle: Duration::from_secs(5),
        }
    }
}

impl SchedulerConfig {
    #[must_use]
    pub fn with_budget(mut self, max_calls: u32, window: Duration) -> Self {
        self.max_calls = max_calls;
        self.window = window;
        self
    }

    #[must_use]
    pub fn with_pump_interval(mut self, interval: Duration) -> Self {
        self.pump_interval = interval;
        self
    }

    #[must_use]
    pub fn with_default_throttle(mut self, throttle: Duration) -> Self {
        self.default_throttle = throttle;
        self
    }
}

/// A parked admission request.
struct Waiter {
    tier: u8,
    seq: u64,
    permit: oneshot::Sender<()>,
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.tier == other.tier && self.seq == other.seq
    }
}

impl Eq for Waiter {}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Waiter {
    // BinaryHeap pops the maximum; reverse so the lowest (tier, seq) -
    // most urgent, earliest arrival - pops first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (other.tier, other.seq).cmp(&(self.tier, self.seq))
    }
}

/// Budget state for a single destination.
struct BudgetState {
    max_calls: u32,
    current_calls: u32,
    window_reset_at: Instant,
    throttled_until: Option<Instant>,
    pending: BinaryHeap<Waiter>,
}

impl BudgetState {
    fn new(config: &SchedulerConfig) -> Self {
        Self {
            max_calls: config.max_calls,
            current_calls: 0,
            window_reset_at: Instant::now() + config.window,
            throttled_until: None,
            pending: BinaryHeap::new(),
        }
    }

    /// Reset the window and clear an expired throttle.
    fn roll(&mut self, now: Instant, window: Duration) {
        if let Some(until) = self.throttled_until {
            if now >= until {
                self.throttled_until = None;
                self.current_calls = 0;
                self.window_reset_at = now + window;
            }
        }
        if self.throttled_until.is_none() && now >= self.window_reset_at {
            self.current_calls = 0;
            self.window_reset_at = now + window;
        }
    }

    fn has_budget(&self) -> bool {
        self.throttled_until.is_none() && self.current_calls < self.max_calls
    }
}

/// Per-destination budget statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BudgetStats {
    pub current_calls: u32,
    pub max_calls: u32,
    pub queued: usize,
    pub throttled: bool,
}

/// Priority-aware, per-destination admission control.
///
/// Construct inside a tokio runtime: [`ConnectionScheduler::new`] spawns
/// the pump task, which exits once the scheduler is dropped.
pub struct ConnectionScheduler {
    config: SchedulerConfig,
    states: Mutex<HashMap<Destination, BudgetState>>,
    seq: AtomicU64,
}

impl ConnectionScheduler {
    /// Create a scheduler and start its pump task.
    #[must_use]
    pub fn new(config: SchedulerConfig) -> Arc<Self> {
        let scheduler = Arc::new(Self {
            config: config.clone(),
            states: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(0),
        });

        let weak = Arc::downgrade(&scheduler);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(config.pump_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                let Some(scheduler) = weak.upgrade() else {
                    break;
                };
                scheduler.pump().await;
            }
        });

        scheduler
    }

    /// Wait for admission to call `destination`.
    ///
    /// Resolves immediately while budget remains and no one is queued
    /// ahead; otherwise parks until the pump releases this waiter in
    /// priority-then-FIFO order.
    pub async fn admit(&self, destination: &Destination, priority: Priority) -> GatewayResult<()> {
        let rx = {
            let mut states = self.states.lock().await;
            let state = states
                .entry(destination.clone())
                .or_insert_with(|| BudgetState::new(&self.config));
            state.roll(Instant::now(), self.config.window);

            // Queued waiters keep their place: new arrivals may only jump
            // straight in when nothing is parked.
            if state.has_budget() && state.pending.is_empty() {
                state.current_calls += 1;
                return Ok(());
            }

            let (tx, rx) = oneshot::channel();
            let seq = self.seq.fetch_add(1, Ordering::Relaxed);
            state.pending.push(Waiter {
                tier: priority.tier(),
                seq,
                permit: tx,
            });
            tracing::debug!(
                target: "connection_scheduler",
                destination = %destination,
                priority = priority.as_str(),
                queued = state.pending.len(),
                "Call queued awaiting budget"
            );
            rx
        };

        rx.await.map_err(|_| GatewayError::SchedulerClosed)
    }

    /// Throttle a destination after a 429 response.
    ///
    /// Holds all admissions, queued ones included, until the retry-after
    /// hint (or the default throttle) elapses.
    pub async fn mark_throttled(&self, destination: &Destination, retry_after: Option<Duration>) {
        let wait = retry_after.unwrap_or(self.config.default_throttle);
        let mut states = self.states.lock().await;
        let state = states
            .entry(destination.clone())
            .or_insert_with(|| BudgetState::new(&self.config));
        state.throttled_until = Some(Instant::now() + wait);
        tracing::warn!(
            target: "connection_scheduler",
            destination = %destination,
            throttle_secs = wait.as_secs_f64(),
            "Destination throttled after rate-limit response"
        );
    }

    /// Adopt the quota a response header reported.
    ///
    /// The platform's call-limit header is authoritative: it replaces our
    /// local count and lets the scheduler throttle proactively when the
    /// bucket is nearly full.
    pub async fn update_quota(&self, destination: &Destination, used: u32, max: u32) {
        if max == 0 {
            return;
        }
        let mut states = self.states.lock().await;
        let state = states
            .entry(destination.clone())
            .or_insert_with(|| BudgetState::new(&self.config));

        state.current_calls = used.min(max);
        state.max_calls = max;

        // Project when the leaky bucket will have drained what we used.
        let drain_secs = (f64::from(used) / self.config.drain_per_second).ceil();
        state.window_reset_at = Instant::now() + Duration::from_secs_f64(drain_secs.max(0.0));

        let utilization = f64::from(used) / f64::from(max);
        if utilization >= 0.95 {
            state.throttled_until = Some(state.window_reset_at);
            tracing::warn!(
                target: "connection_scheduler",
                destination = %destination,
                used,
                max,
                "Call budget critical - holding admissions until reset"
            );
        } else if utilization >= 0.8 {
            tracing::warn!(
                target: "connection_scheduler",
                destination = %destination,
                used,
                max,
                "Approaching call budget limit"
            );
        }
    }

    /// Current budget statistics for a destination.
    pub async fn stats(&self, destination: &Destination) -> Option<BudgetStats> {
        let states = self.states.lock().await;
        states.get(destination).map(|s| BudgetStats {
            current_calls: s.current_calls,
            max_calls: s.max_calls,
            queued: s.pending.len(),
            throttled: s.throttled_until.is_some(),
        })
    }

    /// Release queued waiters into whatever budget has replenished.
    async fn pump(&self) {
        let now = Instant::now();
        let mut states = self.states.lock().await;
        for (destination, state) in states.iter_mut() {
            state.roll(now, self.config.window);
            while state.has_budget() {
                let Some(waiter) = state.pending.pop() else {
                    break;
                };
                // A dropped receiver (caller gave up) does not consume
                // budget.
                if waiter.permit.send(()).is_ok() {
                    state.current_calls += 1;
                    tracing::trace!(
                        target: "connection_scheduler",
                        destination = %destination,
                        remaining_queue = state.pending.len(),
                        "Released queued call"
                    );
                }
            }
        }
    }
}
