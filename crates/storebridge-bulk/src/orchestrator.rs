//! Bulk job orchestration: submit, poll, retry, cancel, sweep.
//!
//! Polling is an explicit bounded loop with a sleep between attempts.
//! Cancellation is best-effort against the platform: the local
//! transition to Canceled happens regardless of the destination's
//! acknowledgment. Background sweeps flag stalled jobs and purge old
//! terminal ones.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use storebridge_core::{Destination, JobId};

use crate::api::{BulkOperationApi, RemoteStatus};
use crate::error::{BulkJobError, BulkJobResult};
use crate::job::{BulkJob, BulkJobStatus};
use crate::results::{self, EntityProcessor, ParsedResults, ResultPage};
use crate::store::{JobFilter, JobMetrics, JobPage, JobStore};

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Default attempt budget for [`BulkJobOrchestrator::poll_until_done`].
    pub poll_max_retries: u32,
    /// Default delay between poll attempts.
    pub poll_delay: Duration,
    /// Running jobs idle longer than this are flagged TimedOut.
    pub stalled_after: Duration,
    /// Completed/Failed jobs older than this are purged.
    pub retention: Duration,
    /// Cadence of the stalled/purge sweeps.
    pub sweep_interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            poll_max_retries: 10,
            poll_delay: Duration::from_secs(2),
            stalled_after: Duration::from_secs(3 * 3600),
            retention: Duration::from_secs(30 * 24 * 3600),
            sweep_interval: Duration::from_secs(600),
        }
    }
}

impl OrchestratorConfig {
    #[must_use]
    pub fn with_polling(mut self, max_retries: u32, delay: Duration) -> Self {
        self.poll_max_retries = max_retries;
        self.poll_delay = delay;
        self
    }

    #[must_use]
    pub fn with_stalled_after(mut self, stalled_after: Duration) -> Self {
        self.stalled_after = stalled_after;
        self
    }

    #[must_use]
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }
}

/// Drives bulk export jobs through their lifecycle.
#[derive(Clone)]
pub struct BulkJobOrchestrator {
    api: Arc<dyn BulkOperationApi>,
    store: Arc<dyn JobStore>,
    config: OrchestratorConfig,
    shutdown: Arc<AtomicBool>,
}

impl BulkJobOrchestrator {
    #[must_use]
    pub fn new(
        api: Arc<dyn BulkOperationApi>,
        store: Arc<dyn JobStore>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            api,
            store,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    async fn get(&self, job_id: JobId) -> BulkJobResult<BulkJob> {
        self.store
            .find_by_id(job_id)
            .await?
            .ok_or(BulkJobError::NotFound(job_id))
    }

    /// Submit an export query and start tracking it.
    ///
    /// The job is persisted as Created first, then flipped to Running
    /// once the destination acknowledges. A rejected submission leaves
    /// the job Failed (and therefore retryable).
    pub async fn start(
        &self,
        destination: Destination,
        query: impl Into<String>,
        description: impl Into<String>,
    ) -> BulkJobResult<BulkJob> {
        let mut job = BulkJob::new(destination, query, description);
        let correlation = job.id.to_string();
        self.store.insert(job.clone()).await?;

        match self
            .api
            .submit(&job.destination, &job.query, &correlation)
            .await
        {
            Ok(remote) => {
                job.mark_running(remote.id);
                self.store.update(&job).await?;
                tracing::info!(
                    target: "bulk_orchestrator",
                    job_id = %job.id,
                    destination = %job.destination,
                    external_operation_id = job.external_operation_id.as_deref().unwrap_or(""),
                    "Bulk operation started"
                );
                Ok(job)
            }
            Err(err) => {
                tracing::error!(
                    target: "bulk_orchestrator",
                    job_id = %job.id,
                    destination = %job.destination,
                    error = %err,
                    "Bulk operation submission failed"
                );
                job.fail(None, err.to_string());
                self.store.update(&job).await?;
                Err(err.into())
            }
        }
    }

    /// Fetch the destination's current view of a Running job and fold it
    /// into local state. Non-Running jobs are returned unchanged.
    ///
    /// Fetch errors leave the job untouched; polling is best-effort.
    pub async fn poll(&self, job_id: JobId) -> BulkJobResult<BulkJob> {
        let mut job = self.get(job_id).await?;
        if job.status != BulkJobStatus::Running {
            return Ok(job);
        }

        let Some(operation_id) = job.external_operation_id.clone() else {
            // Running without an operation id cannot happen through this
            // orchestrator; surface rather than guess.
            return Err(BulkJobError::Store(format!(
                "running job {} has no external operation id",
                job.id
            )));
        };

        let correlation = job.id.to_string();
        let remote = self
            .api
            .fetch(&job.destination, &operation_id, &correlation)
            .await?;

        match remote.status {
            RemoteStatus::Completed => {
                job.complete(
                    remote.url,
                    remote.object_count,
                    remote.file_size,
                    remote.completed_at,
                );
                tracing::info!(
                    target: "bulk_orchestrator",
                    job_id = %job.id,
                    object_count = job.object_count,
                    "Bulk operation completed"
                );
            }
            RemoteStatus::Failed => {
                let detail = remote
                    .status_message
                    .or(remote.error_code.clone())
                    .unwrap_or_else(|| "unknown error".to_string());
                job.fail(remote.error_code, detail);
                tracing::warn!(
                    target: "bulk_orchestrator",
                    job_id = %job.id,
                    error = job.error_detail.as_deref().unwrap_or(""),
                    "Bulk operation failed"
                );
            }
            RemoteStatus::Canceled => {
                // Cancellation initiated on the platform side.
                let _ = job.cancel("canceled by destination");
            }
            RemoteStatus::Created | RemoteStatus::Running | RemoteStatus::Unknown => {
                job.update_progress(remote.object_count, remote.root_object_count);
            }
        }

        self.store.update(&job).await?;
        Ok(job)
    }

    /// Poll until the job leaves Created/Running, sleeping `delay`
    /// between attempts.
    ///
    /// Transient gateway errors are tolerated and retried; the attempt
    /// budget is the only bound. Exhausting it while the job is still
    /// non-terminal raises [`BulkJobError::PollTimeout`].
    pub async fn poll_until_done(
        &self,
        job_id: JobId,
        max_retries: u32,
        delay: Duration,
    ) -> BulkJobResult<BulkJob> {
        for attempt in 1..=max_retries {
            match self.poll(job_id).await {
                Ok(job) if !job.status.is_active() => return Ok(job),
                Ok(_) => {
                    tracing::debug!(
                        target: "bulk_orchestrator",
                        job_id = %job_id,
                        attempt,
                        max_retries,
                        "Bulk operation still running"
                    );
                }
                Err(BulkJobError::Gateway(err)) => {
                    tracing::warn!(
                        target: "bulk_orchestrator",
                        job_id = %job_id,
                        attempt,
                        error = %err,
                        "Poll attempt failed"
                    );
                }
                Err(other) => return Err(other),
            }
            if attempt < max_retries {
                tokio::time::sleep(delay).await;
            }
        }

        Err(BulkJobError::PollTimeout {
            id: job_id,
            attempts: max_retries,
        })
    }

    /// Poll until done with the configured defaults.
    pub async fn poll_until_done_default(&self, job_id: JobId) -> BulkJobResult<BulkJob> {
        self.poll_until_done(job_id, self.config.poll_max_retries, self.config.poll_delay)
            .await
    }

    /// Retry a Failed or TimedOut job.
    ///
    /// Resets the job to Created with `retry_count + 1`, then resubmits
    /// best-effort: if the destination is unreachable the job stays
    /// Created and a later retry can resubmit it.
    pub async fn retry(&self, job_id: JobId) -> BulkJobResult<BulkJob> {
        let mut job = self.get(job_id).await?;
        job.prepare_retry()?;
        self.store.update(&job).await?;

        let correlation = job.id.to_string();
        match self
            .api
            .submit(&job.destination, &job.query, &correlation)
            .await
        {
            Ok(remote) => {
                job.mark_running(remote.id);
                self.store.update(&job).await?;
                tracing::info!(
                    target: "bulk_orchestrator",
                    job_id = %job.id,
                    retry_count = job.retry_count,
                    "Bulk operation resubmitted"
                );
            }
            Err(err) => {
                tracing::warn!(
                    target: "bulk_orchestrator",
                    job_id = %job.id,
                    retry_count = job.retry_count,
                    error = %err,
                    "Resubmission failed - job remains created"
                );
            }
        }

        Ok(job)
    }

    /// Cancel a Created or Running job.
    ///
    /// The platform cancel is requested best-effort; the local
    /// transition happens regardless so local completion is never
    /// coupled to the destination's acknowledgment.
    pub async fn cancel(&self, job_id: JobId, reason: Option<&str>) -> BulkJobResult<BulkJob> {
        let mut job = self.get(job_id).await?;
        if !job.status.can_cancel() {
            return Err(BulkJobError::InvalidTransition {
                id: job.id,
                action: "cancel",
                status: job.status,
            });
        }

        if let Some(operation_id) = job.external_operation_id.clone() {
            let correlation = job.id.to_string();
            match self
                .api
                .request_cancel(&job.destination, &operation_id, &correlation)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    tracing::warn!(
                        target: "bulk_orchestrator",
                        job_id = %job.id,
                        "Platform declined cancellation - marking canceled locally anyway"
                    );
                }
                Err(err) => {
                    tracing::warn!(
                        target: "bulk_orchestrator",
                        job_id = %job.id,
                        error = %err,
                        "Platform cancel request failed - marking canceled locally anyway"
                    );
                }
            }
        }

        job.cancel(reason.unwrap_or("canceled by user"))?;
        self.store.update(&job).await?;
        Ok(job)
    }

    // ------------------------------------------------------------------
    // Query surface
    // ------------------------------------------------------------------

    pub async fn find(&self, job_id: JobId) -> BulkJobResult<Option<BulkJob>> {
        self.store.find_by_id(job_id).await
    }

    pub async fn list(
        &self,
        destination: &Destination,
        filter: JobFilter,
    ) -> BulkJobResult<JobPage> {
        self.store.list_by_destination(destination, filter).await
    }

    pub async fn metrics(&self, destination: Option<&Destination>) -> BulkJobResult<JobMetrics> {
        self.store.metrics(destination).await
    }

    // ------------------------------------------------------------------
    // Result consumption
    // ------------------------------------------------------------------

    async fn load_results(
        &self,
        job_id: JobId,
        processor: Option<&EntityProcessor>,
    ) -> BulkJobResult<ParsedResults> {
        let job = self.get(job_id).await?;
        if job.status != BulkJobStatus::Completed {
            return Err(BulkJobError::ResultsUnavailable {
                id: job.id,
                status: job.status,
            });
        }
        let url = job
            .result_url
            .clone()
            .ok_or(BulkJobError::MissingResultUrl { id: job.id })?;

        let correlation = job.id.to_string();
        let stream = self
            .api
            .download(&job.destination, &url, &correlation)
            .await?;
        results::collect_records(stream, processor).await
    }

    /// Cursor-paginated view over a completed job's records.
    pub async fn fetch_results_page(
        &self,
        job_id: JobId,
        cursor: Option<&str>,
        limit: usize,
        processor: Option<&EntityProcessor>,
    ) -> BulkJobResult<ResultPage> {
        let parsed = self.load_results(job_id, processor).await?;
        Ok(results::paginate(&parsed.records, cursor, limit))
    }

    /// Full drain of a completed job's records, with skip accounting.
    pub async fn drain_results(
        &self,
        job_id: JobId,
        processor: Option<&EntityProcessor>,
    ) -> BulkJobResult<ParsedResults> {
        self.load_results(job_id, processor).await
    }

    // ------------------------------------------------------------------
    // Background sweeps
    // ------------------------------------------------------------------

    /// Flag Running jobs idle past the stalled threshold as TimedOut.
    pub async fn mark_stalled(&self) -> BulkJobResult<usize> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.stalled_after)
                .unwrap_or_else(|_| chrono::Duration::hours(3));
        let stalled = self.store.find_stalled(cutoff).await?;
        let count = stalled.len();

        for mut job in stalled {
            job.time_out(format!(
                "job timed out after {}s of inactivity",
                self.config.stalled_after.as_secs()
            ));
            self.store.update(&job).await?;
            tracing::warn!(
                target: "bulk_orchestrator",
                job_id = %job.id,
                "Stalled bulk job flagged as timed out"
            );
        }
        Ok(count)
    }

    /// Purge Completed/Failed jobs past the retention window.
    pub async fn purge_expired(&self) -> BulkJobResult<usize> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.retention)
                .unwrap_or_else(|_| chrono::Duration::days(30));
        let purged = self.store.purge_terminal_older_than(cutoff).await?;
        if purged > 0 {
            tracing::info!(
                target: "bulk_orchestrator",
                purged,
                "Purged old terminal bulk jobs"
            );
        }
        Ok(purged)
    }

    /// Run the stalled and retention sweeps until shutdown.
    pub async fn run_sweeps(&self) {
        let mut tick = tokio::time::interval(self.config.sweep_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tick.tick().await;
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }
            if let Err(err) = self.mark_stalled().await {
                tracing::error!(
                    target: "bulk_orchestrator",
                    error = %err,
                    "Stalled-job sweep failed"
                );
            }
            if let Err(err) = self.purge_expired().await {
                tracing::error!(
                    target: "bulk_orchestrator",
                    error = %err,
                    "Retention sweep failed"
                );
            }
        }
        tracing::info!(target: "bulk_orchestrator", "Sweep loop stopped");
    }

    /// Request the sweep loop to stop.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}
