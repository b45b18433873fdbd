//! Idempotency ledger for inbound events.
//!
//! At-least-once delivery means redeliveries are routine. The ledger is
//! two-tier: a fast in-memory TTL map, backed by an optional durable
//! store consulted on cache miss. A processed event id is never
//! dispatched to a handler again while its retention window holds.
//!
//! The in-process check-then-act sequence has a race window under
//! concurrent duplicate delivery; cross-process at-most-one effect relies
//! on the durable store's atomic set-if-absent, which implementations of
//! [`DedupStore`] must provide.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use storebridge_core::{EventId, ProcessingOutcome};

/// Durable second tier of the ledger.
///
/// Implementations back this with a shared store reachable by all
/// processes (the in-memory tier alone degrades the dedup guarantee to
/// per-process).
#[async_trait]
pub trait DedupStore: Send + Sync {
    /// Atomically record `id` if absent. Returns `false` when the id was
    /// already present (the stored outcome wins).
    async fn put_if_absent(&self, id: &EventId, outcome: &ProcessingOutcome, ttl: Duration)
        -> bool;

    /// Fetch the stored outcome for `id`, if still retained.
    async fn get(&self, id: &EventId) -> Option<ProcessingOutcome>;
}

/// Deduplicator configuration.
#[derive(Debug, Clone)]
pub struct DeduplicatorConfig {
    /// Retention for processed ids. Long enough to cover the platform's
    /// redelivery window.
    pub ttl: Duration,
}

impl Default for DeduplicatorConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3 * 24 * 3600),
        }
    }
}

impl DeduplicatorConfig {
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }
}

struct CacheEntry {
    outcome: ProcessingOutcome,
    expires_at: Instant,
}

/// Result of a deduplicated execution.
#[derive(Debug, Clone)]
pub struct DedupResult {
    pub outcome: ProcessingOutcome,
    /// True when the stored outcome was returned without running the
    /// closure.
    pub replayed: bool,
}

/// Two-tier idempotency ledger.
pub struct Deduplicator {
    entries: Mutex<HashMap<EventId, CacheEntry>>,
    durable: Option<Arc<dyn DedupStore>>,
    config: DeduplicatorConfig,
}

impl Deduplicator {
    #[must_use]
    pub fn new(config: DeduplicatorConfig) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            durable: None,
            config,
        }
    }

    /// Attach a durable second tier.
    #[must_use]
    pub fn with_durable_store(mut self, store: Arc<dyn DedupStore>) -> Self {
        self.durable = Some(store);
        self
    }

    /// Whether `id` has been processed within the retention window.
    pub async fn is_processed(&self, id: &EventId) -> bool {
        self.stored_outcome(id).await.is_some()
    }

    /// The stored outcome for `id`, if processed and retained.
    ///
    /// A cache miss falls through to the durable tier before concluding
    /// "not processed"; durable hits are re-cached.
    pub async fn stored_outcome(&self, id: &EventId) -> Option<ProcessingOutcome> {
        {
            let entries = self.entries.lock().await;
            if let Some(entry) = entries.get(id) {
                if entry.expires_at > Instant::now() {
                    return Some(entry.outcome.clone());
                }
            }
        }

        let durable = self.durable.as_ref()?;
        let outcome = durable.get(id).await?;

        let mut entries = self.entries.lock().await;
        entries.insert(
            id.clone(),
            CacheEntry {
                outcome: outcome.clone(),
                expires_at: Instant::now() + self.config.ttl,
            },
        );
        Some(outcome)
    }

    /// Record `id` as processed in both tiers.
    pub async fn mark_processed(&self, id: &EventId, outcome: ProcessingOutcome) {
        {
            let mut entries = self.entries.lock().await;
            entries.insert(
                id.clone(),
                CacheEntry {
                    outcome: outcome.clone(),
                    expires_at: Instant::now() + self.config.ttl,
                },
            );
        }

        if let Some(durable) = &self.durable {
            let fresh = durable.put_if_absent(id, &outcome, self.config.ttl).await;
            if !fresh {
                tracing::debug!(
                    target: "webhook_dedup",
                    event_id = %id,
                    "Durable store already held this id"
                );
            }
        }
    }

    /// Run `f` unless `id` was already processed.
    ///
    /// Replays return the stored outcome without invoking `f`; fresh ids
    /// run `f` and are marked processed with its outcome.
    pub async fn with_deduplication<F, Fut>(&self, id: &EventId, f: F) -> DedupResult
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = ProcessingOutcome>,
    {
        if let Some(outcome) = self.stored_outcome(id).await {
            tracing::debug!(
                target: "webhook_dedup",
                event_id = %id,
                "Duplicate delivery - returning stored outcome"
            );
            return DedupResult {
                outcome,
                replayed: true,
            };
        }

        let outcome = f().await;
        self.mark_processed(id, outcome.clone()).await;
        DedupResult {
            outcome,
            replayed: false,
        }
    }

    /// Evict expired in-memory entries. Returns the number removed.
    ///
    /// Driven by the scheduler's background sweep.
    pub async fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        let evicted = before - entries.len();
        if evicted > 0 {
            tracing::debug!(
                target: "webhook_dedup",
                evicted,
                remaining = entries.len(),
                "Evicted expired dedup entries"
            );
        }
        evicted
    }

    /// Number of ids currently cached (expired or not).
    pub async fn cached_len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dedup_with_ttl(ttl: Duration) -> Deduplicator {
        Deduplicator::new(DeduplicatorConfig::default().with_ttl(ttl))
    }

    #[tokio::test]
    async fn test_unprocessed_before_mark_processed_after() {
        let dedup = dedup_with_ttl(Duration::from_secs(60));
        let id = EventId::new("wh-1");

        assert!(!dedup.is_processed(&id).await);
        dedup
            .mark_processed(&id, ProcessingOutcome::success("done"))
            .await;
        assert!(dedup.is_processed(&id).await);
    }

    #[tokio::test]
    async fn test_expires_after_ttl() {
        let dedup = dedup_with_ttl(Duration::from_millis(30));
        let id = EventId::new("wh-2");

        dedup
            .mark_processed(&id, ProcessingOutcome::success("done"))
            .await;
        assert!(dedup.is_processed(&id).await);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!dedup.is_processed(&id).await);
    }

    #[tokio::test]
    async fn test_with_deduplication_skips_closure_on_replay() {
        let dedup = dedup_with_ttl(Duration::from_secs(60));
        let id = EventId::new("wh-3");

        let first = dedup
            .with_deduplication(&id, || async { ProcessingOutcome::success("first run") })
            .await;
        assert!(!first.replayed);

        let second = dedup
            .with_deduplication(&id, || async {
                panic!("closure must not run for a duplicate")
            })
            .await;
        assert!(second.replayed);
        assert_eq!(second.outcome.message, "first run");
    }

    #[tokio::test]
    async fn test_evict_expired_removes_only_stale_entries() {
        let dedup = dedup_with_ttl(Duration::from_millis(30));
        dedup
            .mark_processed(&EventId::new("old"), ProcessingOutcome::success("ok"))
            .await;

        tokio::time::sleep(Duration::from_millis(60)).await;
        dedup
            .mark_processed(&EventId::new("new"), ProcessingOutcome::success("ok"))
            .await;

        let evicted = dedup.evict_expired().await;
        assert_eq!(evicted, 1);
        assert_eq!(dedup.cached_len().await, 1);
    }

    /// Durable store stub tracking set-if-absent semantics.
    struct RecordingStore {
        records: Mutex<HashMap<EventId, ProcessingOutcome>>,
    }

    #[async_trait]
    impl DedupStore for RecordingStore {
        async fn put_if_absent(
            &self,
            id: &EventId,
            outcome: &ProcessingOutcome,
            _ttl: Duration,
        ) -> bool {
            let mut records = self.records.lock().await;
            if records.contains_key(id) {
                return false;
            }
            records.insert(id.clone(), outcome.clone());
            true
        }

        async fn get(&self, id: &EventId) -> Option<ProcessingOutcome> {
            self.records.lock().await.get(id).cloned()
        }
    }

    #[tokio::test]
    async fn test_cache_miss_falls_through_to_durable_store() {
        let store = Arc::new(RecordingStore {
            records: Mutex::new(HashMap::new()),
        });
        store
            .put_if_absent(
                &EventId::new("wh-durable"),
                &ProcessingOutcome::success("from store"),
                Duration::from_secs(60),
            )
            .await;

        // Fresh deduplicator: nothing cached, but the durable tier knows.
        let dedup = dedup_with_ttl(Duration::from_secs(60)).with_durable_store(store);
        let id = EventId::new("wh-durable");

        assert!(dedup.is_processed(&id).await);
        let outcome = dedup.stored_outcome(&id).await.unwrap();
        assert_eq!(outcome.message, "from store");
    }

    #[tokio::test]
    async fn test_mark_processed_writes_durable_tier() {
        let store = Arc::new(RecordingStore {
            records: Mutex::new(HashMap::new()),
        });
        let dedup =
            dedup_with_ttl(Duration::from_secs(60)).with_durable_store(store.clone());
        let id = EventId::new("wh-4");

        dedup
            .mark_processed(&id, ProcessingOutcome::success("ok"))
            .await;
        assert!(store.get(&id).await.is_some());
    }
}
