//! Job persistence seam and the in-memory implementation.
//!
//! The orchestrator and the read-only query surface both go through
//! [`JobStore`]. The in-memory implementation is per-process; multi-
//! process deployments implement the trait over a shared store.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use storebridge_core::{Destination, JobId};

use crate::error::{BulkJobError, BulkJobResult};
use crate::job::{BulkJob, BulkJobStatus};

/// Filter and cursor for job listings.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    /// Restrict to these statuses; `None` means all.
    pub statuses: Option<Vec<BulkJobStatus>>,
    /// Page size. Zero falls back to the store default.
    pub limit: usize,
    /// Return jobs strictly after this one in newest-first order.
    pub cursor: Option<JobId>,
}

/// One page of a cursor-paginated job listing, newest first.
#[derive(Debug, Clone)]
pub struct JobPage {
    pub jobs: Vec<BulkJob>,
    pub has_next_page: bool,
    pub end_cursor: Option<JobId>,
}

/// Aggregate metrics over tracked jobs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobMetrics {
    pub total: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub canceled: u64,
    pub timed_out: u64,
    /// Mean of `completed_at - created_at` over completed jobs.
    pub average_completion_ms: Option<f64>,
}

/// Persistence seam for bulk jobs.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, job: BulkJob) -> BulkJobResult<()>;

    /// Persist the current state of an existing job.
    async fn update(&self, job: &BulkJob) -> BulkJobResult<()>;

    async fn find_by_id(&self, id: JobId) -> BulkJobResult<Option<BulkJob>>;

    /// Jobs for one destination, newest first, cursor-paginated.
    async fn list_by_destination(
        &self,
        destination: &Destination,
        filter: JobFilter,
    ) -> BulkJobResult<JobPage>;

    /// Running jobs whose `updated_at` is older than `cutoff`.
    async fn find_stalled(&self, cutoff: DateTime<Utc>) -> BulkJobResult<Vec<BulkJob>>;

    /// Delete Completed and Failed jobs last updated before `cutoff`.
    /// Returns the number removed.
    async fn purge_terminal_older_than(&self, cutoff: DateTime<Utc>) -> BulkJobResult<usize>;

    /// Aggregate metrics, optionally scoped to one destination.
    async fn metrics(&self, destination: Option<&Destination>) -> BulkJobResult<JobMetrics>;
}

const DEFAULT_PAGE_SIZE: usize = 20;

/// In-memory job store.
#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, BulkJob>>,
}

impl InMemoryJobStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: BulkJob) -> BulkJobResult<()> {
        let mut jobs = self.jobs.write().await;
        jobs.insert(job.id, job);
        Ok(())
    }

    async fn update(&self, job: &BulkJob) -> BulkJobResult<()> {
        let mut jobs = self.jobs.write().await;
        if !jobs.contains_key(&job.id) {
            return Err(BulkJobError::NotFound(job.id));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: JobId) -> BulkJobResult<Option<BulkJob>> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn list_by_destination(
        &self,
        destination: &Destination,
        filter: JobFilter,
    ) -> BulkJobResult<JobPage> {
        let limit = if filter.limit == 0 {
            DEFAULT_PAGE_SIZE
        } else {
            filter.limit
        };

        let jobs = self.jobs.read().await;
        let mut matching: Vec<BulkJob> = jobs
            .values()
            .filter(|j| &j.destination == destination)
            .filter(|j| {
                filter
                    .statuses
                    .as_ref()
                    .map_or(true, |statuses| statuses.contains(&j.status))
            })
            .cloned()
            .collect();

        // Newest first; ids break creation-time ties deterministically.
        matching.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.as_uuid().cmp(&a.id.as_uuid()))
        });

        let start = match filter.cursor {
            Some(cursor) => match matching.iter().position(|j| j.id == cursor) {
                Some(idx) => idx + 1,
                // Unknown cursor (purged job): start from the beginning.
                None => 0,
            },
            None => 0,
        };

        let end = (start + limit).min(matching.len());
        let page: Vec<BulkJob> = matching[start..end].to_vec();
        let has_next_page = end < matching.len();
        let end_cursor = page.last().map(|j| j.id);

        Ok(JobPage {
            jobs: page,
            has_next_page,
            end_cursor,
        })
    }

    async fn find_stalled(&self, cutoff: DateTime<Utc>) -> BulkJobResult<Vec<BulkJob>> {
        let jobs = self.jobs.read().await;
        Ok(jobs
            .values()
            .filter(|j| j.status == BulkJobStatus::Running && j.updated_at < cutoff)
            .cloned()
            .collect())
    }

    async fn purge_terminal_older_than(&self, cutoff: DateTime<Utc>) -> BulkJobResult<usize> {
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, j| {
            !(matches!(j.status, BulkJobStatus::Completed | BulkJobStatus::Failed)
                && j.updated_at < cutoff)
        });
        Ok(before - jobs.len())
    }

    async fn metrics(&self, destination: Option<&Destination>) -> BulkJobResult<JobMetrics> {
        let jobs = self.jobs.read().await;
        let mut metrics = JobMetrics::default();
        let mut completion_total_ms = 0.0;
        let mut completion_samples = 0u64;

        for job in jobs
            .values()
            .filter(|j| destination.map_or(true, |d| &j.destination == d))
        {
            metrics.total += 1;
            match job.status {
                BulkJobStatus::Created | BulkJobStatus::Running => metrics.active += 1,
                BulkJobStatus::Completed => {
                    metrics.completed += 1;
                    if let Some(completed_at) = job.completed_at {
                        completion_total_ms +=
                            (completed_at - job.created_at).num_milliseconds() as f64;
                        completion_samples += 1;
                    }
                }
                BulkJobStatus::Failed => metrics.failed += 1,
                BulkJobStatus::Canceled => metrics.canceled += 1,
                BulkJobStatus::TimedOut => metrics.timed_out += 1,
            }
        }

        if completion_samples > 0 {
            metrics.average_completion_ms =
                Some(completion_total_ms / completion_samples as f64);
        }

        Ok(metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dest() -> Destination {
        Destination::new("shop.example.com")
    }

    fn job_for(destination: &Destination) -> BulkJob {
        BulkJob::new(destination.clone(), "{ orders }", "export")
    }

    #[tokio::test]
    async fn test_insert_and_find() {
        let store = InMemoryJobStore::new();
        let job = job_for(&dest());
        let id = job.id;

        store.insert(job).await.unwrap();
        assert!(store.find_by_id(id).await.unwrap().is_some());
        assert!(store.find_by_id(JobId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_unknown_job_is_not_found() {
        let store = InMemoryJobStore::new();
        let job = job_for(&dest());
        let err = store.update(&job).await.unwrap_err();
        assert!(matches!(err, BulkJobError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_list_filters_by_destination_and_status() {
        let store = InMemoryJobStore::new();
        let mine = dest();
        let other = Destination::new("other.example.com");

        let mut failed = job_for(&mine);
        failed.mark_running("op-1");
        failed.fail(None, "boom");
        store.insert(failed).await.unwrap();
        store.insert(job_for(&mine)).await.unwrap();
        store.insert(job_for(&other)).await.unwrap();

        let all = store
            .list_by_destination(&mine, JobFilter::default())
            .await
            .unwrap();
        assert_eq!(all.jobs.len(), 2);

        let failed_only = store
            .list_by_destination(
                &mine,
                JobFilter {
                    statuses: Some(vec![BulkJobStatus::Failed]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(failed_only.jobs.len(), 1);
        assert_eq!(failed_only.jobs[0].status, BulkJobStatus::Failed);
    }

    #[tokio::test]
    async fn test_cursor_pagination_walks_all_jobs() {
        let store = InMemoryJobStore::new();
        let d = dest();
        for _ in 0..5 {
            store.insert(job_for(&d)).await.unwrap();
            // Distinct created_at for a stable newest-first order.
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }

        let mut seen = Vec::new();
        let mut cursor = None;
        loop {
            let page = store
                .list_by_destination(
                    &d,
                    JobFilter {
                        limit: 2,
                        cursor,
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
            seen.extend(page.jobs.iter().map(|j| j.id));
            if !page.has_next_page {
                break;
            }
            cursor = page.end_cursor;
        }

        assert_eq!(seen.len(), 5);
        let unique: std::collections::HashSet<_> = seen.iter().collect();
        assert_eq!(unique.len(), 5, "no job repeated across pages");
    }

    #[tokio::test]
    async fn test_find_stalled_only_matches_old_running_jobs() {
        let store = InMemoryJobStore::new();
        let d = dest();

        let mut running = job_for(&d);
        running.mark_running("op-1");
        store.insert(running).await.unwrap();
        store.insert(job_for(&d)).await.unwrap(); // Created, not stalled

        // Cutoff in the future: the running job's updated_at is older.
        let stalled = store
            .find_stalled(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(stalled.len(), 1);
        assert_eq!(stalled[0].status, BulkJobStatus::Running);

        // Cutoff in the past: nothing qualifies.
        let none = store
            .find_stalled(Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_purge_removes_only_old_terminal_jobs() {
        let store = InMemoryJobStore::new();
        let d = dest();

        let mut completed = job_for(&d);
        completed.mark_running("op-1");
        completed.complete(Some("https://cdn.example/r.jsonl".to_string()), 10, None, None);
        store.insert(completed).await.unwrap();

        let mut canceled = job_for(&d);
        canceled.cancel("user").unwrap();
        store.insert(canceled).await.unwrap();

        let purged = store
            .purge_terminal_older_than(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(purged, 1, "only the completed job is purged");
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_metrics_counts_and_average() {
        let store = InMemoryJobStore::new();
        let d = dest();

        let mut completed = job_for(&d);
        completed.mark_running("op-1");
        completed.complete(Some("https://cdn.example/r.jsonl".to_string()), 10, None, None);
        store.insert(completed).await.unwrap();

        let mut failed = job_for(&d);
        failed.mark_running("op-2");
        failed.fail(None, "boom");
        store.insert(failed).await.unwrap();

        store.insert(job_for(&d)).await.unwrap();

        let metrics = store.metrics(Some(&d)).await.unwrap();
        assert_eq!(metrics.total, 3);
        assert_eq!(metrics.active, 1);
        assert_eq!(metrics.completed, 1);
        assert_eq!(metrics.failed, 1);
        assert!(metrics.average_completion_ms.is_some());

        let scoped = store
            .metrics(Some(&Destination::new("nobody.example.com")))
            .await
            .unwrap();
        assert_eq!(scoped.total, 0);
        assert!(scoped.average_completion_ms.is_none());
    }
}
