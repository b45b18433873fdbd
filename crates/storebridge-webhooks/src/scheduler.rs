//! Priority retry scheduler for inbound events.
//!
//! Validated, unique events are admitted to a priority queue (tier, then
//! arrival order) and dispatched to their topic handler by a background
//! drain loop. Failures retry with bounded exponential backoff; exhausted
//! events are dead-lettered with their last error preserved. A periodic
//! resweep grants dead-lettered events a bounded number of additional
//! best-effort passes.
//!
//! Handler execution is supervised: panics are converted into failed
//! outcomes and can never crash the ingestion path.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tokio::task::AbortHandle;

use storebridge_core::{EventId, ProcessingOutcome};

use crate::dedup::Deduplicator;
use crate::event::InboundEvent;
use crate::registry::{EventHandler, HandlerRegistry};

/// Retry scheduler configuration.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delivery attempts per event before dead-lettering.
    pub max_attempts: u32,
    /// First retry delay.
    pub initial_delay: Duration,
    /// Backoff multiplier applied per attempt.
    pub backoff_multiplier: f64,
    /// Upper bound on a single retry delay.
    pub max_delay: Duration,
    /// Additional best-effort passes granted to dead-lettered events.
    pub max_resweep_passes: u32,
    /// How often the dead-letter resweep runs.
    pub resweep_interval: Duration,
    /// How often expired dedup entries are evicted.
    pub dedup_sweep_interval: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            backoff_multiplier: 5.0,
            max_delay: Duration::from_secs(15),
            max_resweep_passes: 1,
            resweep_interval: Duration::from_secs(300),
            dedup_sweep_interval: Duration::from_secs(60),
        }
    }
}

impl RetryConfig {
    #[must_use]
    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = max;
        self
    }

    #[must_use]
    pub fn with_backoff(
        mut self,
        initial_delay: Duration,
        multiplier: f64,
        max_delay: Duration,
    ) -> Self {
        self.initial_delay = initial_delay;
        self.backoff_multiplier = multiplier;
        self.max_delay = max_delay;
        self
    }

    #[must_use]
    pub fn with_max_resweep_passes(mut self, passes: u32) -> Self {
        self.max_resweep_passes = passes;
        self
    }

    /// Delay before the retry following failure number `attempts`
    /// (0-based): `min(initial * multiplier^attempts, max_delay)`.
    #[must_use]
    pub fn backoff_delay(&self, attempts: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempts.min(i32::MAX as u32) as i32);
        Duration::from_secs_f64(base.min(self.max_delay.as_secs_f64()))
    }
}

/// Outcome of an enqueue call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueStatus {
    /// Admitted to the queue.
    Queued,
    /// The same event id is already queued, in flight, or awaiting retry.
    DuplicatePending,
    /// The event was already processed within the dedup retention window.
    AlreadyProcessed,
}

/// A permanently failed event retained for inspection.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub event: InboundEvent,
    pub last_error: String,
    pub dead_lettered_at: DateTime<Utc>,
    /// Resweep passes consumed so far.
    pub resweep_passes: u32,
}

struct QueuedJob {
    tier: u8,
    seq: u64,
    event: InboundEvent,
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.tier == other.tier && self.seq == other.seq
    }
}

impl Eq for QueuedJob {}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedJob {
    // Max-heap; reverse so lowest (tier, seq) pops first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (other.tier, other.seq).cmp(&(self.tier, self.seq))
    }
}

enum TrackedState {
    Queued,
    InFlight,
    WaitingRetry(AbortHandle),
}

struct QueueState {
    heap: BinaryHeap<QueuedJob>,
    /// Every event id currently owned by the scheduler, in any stage.
    tracked: HashMap<EventId, TrackedState>,
}

struct SchedulerInner {
    config: RetryConfig,
    registry: Arc<HandlerRegistry>,
    dedup: Arc<Deduplicator>,
    state: Mutex<QueueState>,
    dead: Mutex<HashMap<EventId, DeadLetter>>,
    notify: Notify,
    seq: AtomicU64,
    shutdown: AtomicBool,
}

/// Priority retry scheduler. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct RetryScheduler {
    inner: Arc<SchedulerInner>,
}

impl RetryScheduler {
    #[must_use]
    pub fn new(
        config: RetryConfig,
        registry: Arc<HandlerRegistry>,
        dedup: Arc<Deduplicator>,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                config,
                registry,
                dedup,
                state: Mutex::new(QueueState {
                    heap: BinaryHeap::new(),
                    tracked: HashMap::new(),
                }),
                dead: Mutex::new(HashMap::new()),
                notify: Notify::new(),
                seq: AtomicU64::new(0),
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    /// Admit a validated event.
    ///
    /// The event id is the job identity: a redelivered id that is already
    /// pending is not double-enqueued, and an id processed within the
    /// dedup window is refused outright.
    pub async fn enqueue(&self, event: InboundEvent) -> EnqueueStatus {
        if self.inner.dedup.is_processed(&event.id).await {
            tracing::debug!(
                target: "webhook_scheduler",
                event_id = %event.id,
                "Refusing enqueue - already processed"
            );
            return EnqueueStatus::AlreadyProcessed;
        }
        self.inner.clone().push_job(event, false).await
    }

    /// Run the drain loop and background sweeps until shutdown.
    pub async fn run(&self) {
        tracing::info!(
            target: "webhook_scheduler",
            max_attempts = self.inner.config.max_attempts,
            "Retry scheduler started"
        );

        let mut resweep = tokio::time::interval(self.inner.config.resweep_interval);
        resweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut dedup_sweep = tokio::time::interval(self.inner.config.dedup_sweep_interval);
        dedup_sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if self.inner.shutdown.load(Ordering::Relaxed) {
                break;
            }
            tokio::select! {
                () = self.inner.notify.notified() => self.drain_once().await,
                _ = resweep.tick() => {
                    self.resweep_dead_letters().await;
                }
                _ = dedup_sweep.tick() => {
                    self.inner.dedup.evict_expired().await;
                }
            }
        }

        // Finish whatever is already queued before stopping.
        self.drain_once().await;
        tracing::info!(target: "webhook_scheduler", "Retry scheduler stopped");
    }

    /// Request graceful shutdown of the drain loop.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Relaxed);
        self.inner.notify.notify_one();
    }

    /// Process everything currently queued, in priority order.
    pub async fn drain_once(&self) {
        loop {
            let job = {
                let mut state = self.inner.state.lock().await;
                let Some(job) = state.heap.pop() else {
                    break;
                };
                state
                    .tracked
                    .insert(job.event.id.clone(), TrackedState::InFlight);
                job
            };
            self.inner.clone().process(job.event).await;
        }
    }

    /// Re-attempt dead-lettered events, one pass per event per sweep, up
    /// to the configured pass budget. Returns how many were attempted.
    pub async fn resweep_dead_letters(&self) -> usize {
        let eligible: Vec<DeadLetter> = {
            let mut dead = self.inner.dead.lock().await;
            let ids: Vec<EventId> = dead
                .iter()
                .filter(|(_, d)| d.resweep_passes < self.inner.config.max_resweep_passes)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| dead.remove(&id))
                .collect()
        };

        if eligible.is_empty() {
            return 0;
        }

        tracing::info!(
            target: "webhook_scheduler",
            count = eligible.len(),
            "Resweeping dead-lettered events"
        );

        let attempted = eligible.len();
        for entry in eligible {
            self.inner.clone().process_resweep(entry).await;
        }
        attempted
    }

    /// Snapshot of the dead-letter queue.
    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.dead.lock().await.values().cloned().collect()
    }

    /// Number of events currently queued (not in flight or waiting).
    pub async fn queue_len(&self) -> usize {
        self.inner.state.lock().await.heap.len()
    }
}

impl SchedulerInner {
    /// Push a job onto the heap. `is_retry` marks pushes coming from a
    /// fired retry timer, which own their tracked slot already.
    async fn push_job(self: Arc<Self>, event: InboundEvent, is_retry: bool) -> EnqueueStatus {
        {
            let mut state = self.state.lock().await;
            if !is_retry && state.tracked.contains_key(&event.id) {
                tracing::debug!(
                    target: "webhook_scheduler",
                    event_id = %event.id,
                    "Duplicate enqueue ignored - id already pending"
                );
                return EnqueueStatus::DuplicatePending;
            }

            let seq = self.seq.fetch_add(1, Ordering::Relaxed);
            state.tracked.insert(event.id.clone(), TrackedState::Queued);
            tracing::debug!(
                target: "webhook_scheduler",
                event_id = %event.id,
                topic = %event.topic,
                priority = event.priority.as_str(),
                attempts = event.attempts,
                "Event queued"
            );
            state.heap.push(QueuedJob {
                tier: event.priority.tier(),
                seq,
                event,
            });
        }
        self.notify.notify_one();
        EnqueueStatus::Queued
    }

    /// Dispatch one event to its handler and settle the result.
    async fn process(self: Arc<Self>, mut event: InboundEvent) {
        // A concurrent delivery may have completed while this one queued.
        if self.dedup.stored_outcome(&event.id).await.is_some() {
            tracing::debug!(
                target: "webhook_scheduler",
                event_id = %event.id,
                "Skipping dispatch - processed while queued"
            );
            self.untrack(&event.id).await;
            return;
        }

        let Some(handler) = self.registry.dispatch(&event.topic) else {
            tracing::warn!(
                target: "webhook_scheduler",
                event_id = %event.id,
                topic = %event.topic,
                "No handler registered for topic"
            );
            self.dead_letter(event, "no handler registered for topic".to_string())
                .await;
            return;
        };

        let outcome = run_supervised(handler, &event).await;

        if outcome.success {
            tracing::info!(
                target: "webhook_scheduler",
                event_id = %event.id,
                topic = %event.topic,
                attempts = event.attempts + 1,
                "Event processed"
            );
            self.dedup.mark_processed(&event.id, outcome).await;
            self.untrack(&event.id).await;
            return;
        }

        let error = outcome
            .error
            .unwrap_or_else(|| outcome.message.clone());
        let delay = self.config.backoff_delay(event.attempts);
        event.attempts += 1;

        tracing::warn!(
            target: "webhook_scheduler",
            event_id = %event.id,
            topic = %event.topic,
            attempts = event.attempts,
            max_attempts = self.config.max_attempts,
            error = %error,
            "Event processing failed"
        );

        if event.attempts >= self.config.max_attempts {
            self.dead_letter(event, error).await;
        } else {
            self.schedule_retry(event, delay).await;
        }
    }

    /// Schedule a retry timer for an event.
    ///
    /// Timers are replaceable: installing a new one aborts any pending
    /// timer for the same id, so at most one retry is ever in flight per
    /// event.
    async fn schedule_retry(self: &Arc<Self>, event: InboundEvent, delay: Duration) {
        let id = event.id.clone();
        tracing::debug!(
            target: "webhook_scheduler",
            event_id = %id,
            delay_ms = delay.as_millis() as u64,
            "Retry scheduled"
        );

        let mut state = self.state.lock().await;
        let inner = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = inner.push_job(event, true).await;
        })
        .abort_handle();

        if let Some(TrackedState::WaitingRetry(previous)) = state
            .tracked
            .insert(id, TrackedState::WaitingRetry(handle))
        {
            previous.abort();
        }
    }

    /// Record an event as permanently failed, preserving its last error.
    async fn dead_letter(self: &Arc<Self>, event: InboundEvent, last_error: String) {
        self.untrack(&event.id).await;

        let mut dead = self.dead.lock().await;
        let resweep_passes = dead
            .get(&event.id)
            .map(|d| d.resweep_passes)
            .unwrap_or_default();
        tracing::error!(
            target: "webhook_scheduler",
            event_id = %event.id,
            topic = %event.topic,
            attempts = event.attempts,
            error = %last_error,
            "Event dead-lettered"
        );
        dead.insert(
            event.id.clone(),
            DeadLetter {
                event,
                last_error,
                dead_lettered_at: Utc::now(),
                resweep_passes,
            },
        );
    }

    /// One best-effort pass over a dead-lettered event.
    async fn process_resweep(self: Arc<Self>, entry: DeadLetter) {
        let mut event = entry.event;

        if self.dedup.is_processed(&event.id).await {
            return;
        }

        let Some(handler) = self.registry.dispatch(&event.topic) else {
            let mut dead = self.dead.lock().await;
            dead.insert(
                event.id.clone(),
                DeadLetter {
                    event,
                    last_error: entry.last_error,
                    dead_lettered_at: entry.dead_lettered_at,
                    resweep_passes: entry.resweep_passes + 1,
                },
            );
            return;
        };

        let outcome = run_supervised(handler, &event).await;
        event.attempts += 1;

        if outcome.success {
            tracing::info!(
                target: "webhook_scheduler",
                event_id = %event.id,
                attempts = event.attempts,
                "Dead-lettered event recovered on resweep"
            );
            self.dedup.mark_processed(&event.id, outcome).await;
        } else {
            let last_error = outcome.error.unwrap_or(outcome.message);
            let mut dead = self.dead.lock().await;
            dead.insert(
                event.id.clone(),
                DeadLetter {
                    event,
                    last_error,
                    dead_lettered_at: entry.dead_lettered_at,
                    resweep_passes: entry.resweep_passes + 1,
                },
            );
        }
    }

    async fn untrack(&self, id: &EventId) {
        let mut state = self.state.lock().await;
        state.tracked.remove(id);
    }
}

/// Run a handler inside a supervision boundary.
///
/// Panics and task aborts become failed outcomes; nothing a handler does
/// can crash the drain loop.
async fn run_supervised(
    handler: Arc<dyn EventHandler>,
    event: &InboundEvent,
) -> ProcessingOutcome {
    let event = event.clone();
    let join = tokio::spawn(async move { handler.handle(&event).await });
    match join.await {
        Ok(outcome) => outcome,
        Err(e) if e.is_panic() => {
            tracing::error!(
                target: "webhook_scheduler",
                error = %e,
                "Handler panicked"
            );
            ProcessingOutcome::failure("handler panicked", e.to_string())
        }
        Err(e) => ProcessingOutcome::failure("handler task aborted", e.to_string()),
    }
}
