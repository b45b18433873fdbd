//! Bulk job model and state machine.
//!
//! Status transitions are monotonic forward with two explicit exceptions:
//! `retry` (Failed/TimedOut -> Created, incrementing `retry_count`) and
//! `cancel` (Created/Running -> Canceled). Completed and Canceled are
//! terminal.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use storebridge_core::{Destination, JobId};

use crate::error::{BulkJobError, BulkJobResult};

/// Lifecycle status of a bulk export job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkJobStatus {
    Created,
    Running,
    Completed,
    Failed,
    Canceled,
    /// Detected by the stalled-job sweep, never requested.
    TimedOut,
}

impl BulkJobStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
            Self::TimedOut => "timed_out",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(Self::Created),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "canceled" => Some(Self::Canceled),
            "timed_out" => Some(Self::TimedOut),
            _ => None,
        }
    }

    /// Whether the job is still in flight (Created or Running).
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Created | Self::Running)
    }

    /// Whether this status may transition to Created via `retry`.
    #[must_use]
    pub fn can_retry(&self) -> bool {
        matches!(self, Self::Failed | Self::TimedOut)
    }

    /// Whether this status may transition to Canceled via `cancel`.
    #[must_use]
    pub fn can_cancel(&self) -> bool {
        self.is_active()
    }
}

impl fmt::Display for BulkJobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tracked bulk export job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkJob {
    pub id: JobId,
    pub destination: Destination,
    /// The platform's operation id, once acknowledged.
    pub external_operation_id: Option<String>,
    /// The export query submitted to the platform.
    pub query: String,
    pub description: String,
    pub status: BulkJobStatus,
    pub status_message: Option<String>,
    pub error_code: Option<String>,
    pub error_detail: Option<String>,
    /// Time-limited URL of the newline-delimited result file.
    pub result_url: Option<String>,
    pub object_count: u64,
    pub file_size: Option<u64>,
    /// Best-effort progress, capped below 100 until terminal completion.
    pub progress_percentage: u8,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl BulkJob {
    /// Create a job in the Created state.
    #[must_use]
    pub fn new(destination: Destination, query: impl Into<String>, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            destination,
            external_operation_id: None,
            query: query.into(),
            description: description.into(),
            status: BulkJobStatus::Created,
            status_message: None,
            error_code: None,
            error_detail: None,
            result_url: None,
            object_count: 0,
            file_size: None,
            progress_percentage: 0,
            retry_count: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// The destination acknowledged the submission.
    pub fn mark_running(&mut self, external_operation_id: impl Into<String>) {
        self.external_operation_id = Some(external_operation_id.into());
        self.status = BulkJobStatus::Running;
        self.status_message = Some("operation started".to_string());
        self.touch();
    }

    /// Record best-effort progress while running.
    ///
    /// Progress is derived from counted objects over the platform's
    /// root-object estimate and capped at 99 until terminal.
    pub fn update_progress(&mut self, object_count: u64, estimated_total: u64) {
        self.object_count = object_count;
        if estimated_total > 0 {
            let pct = (object_count.saturating_mul(100) / estimated_total).min(99);
            self.progress_percentage = pct as u8;
        }
        self.touch();
    }

    /// Terminal success: record the result location and counts.
    ///
    /// `result_url` can be absent when the export matched nothing.
    pub fn complete(
        &mut self,
        result_url: Option<String>,
        object_count: u64,
        file_size: Option<u64>,
        completed_at: Option<DateTime<Utc>>,
    ) {
        self.status = BulkJobStatus::Completed;
        self.status_message = Some("operation completed".to_string());
        self.result_url = result_url;
        self.object_count = object_count;
        self.file_size = file_size;
        self.progress_percentage = 100;
        self.completed_at = Some(completed_at.unwrap_or_else(Utc::now));
        self.touch();
    }

    /// Terminal failure with the destination's error detail.
    pub fn fail(&mut self, error_code: Option<String>, error_detail: impl Into<String>) {
        self.status = BulkJobStatus::Failed;
        let detail = error_detail.into();
        self.status_message = Some(format!("operation failed: {detail}"));
        self.error_code = error_code;
        self.error_detail = Some(detail);
        self.touch();
    }

    /// Flagged by the stalled-job sweep.
    pub fn time_out(&mut self, message: impl Into<String>) {
        self.status = BulkJobStatus::TimedOut;
        self.status_message = Some(message.into());
        self.touch();
    }

    /// Reset a Failed or TimedOut job to Created for resubmission.
    ///
    /// # Errors
    ///
    /// [`BulkJobError::InvalidTransition`] when the job is in any other
    /// status.
    pub fn prepare_retry(&mut self) -> BulkJobResult<()> {
        if !self.status.can_retry() {
            return Err(BulkJobError::InvalidTransition {
                id: self.id,
                action: "retry",
                status: self.status,
            });
        }
        self.retry_count += 1;
        self.status = BulkJobStatus::Created;
        self.status_message = Some(format!("retry attempt #{}", self.retry_count));
        self.error_code = None;
        self.error_detail = None;
        self.external_operation_id = None;
        self.progress_percentage = 0;
        self.touch();
        Ok(())
    }

    /// Cancel a Created or Running job.
    ///
    /// # Errors
    ///
    /// [`BulkJobError::InvalidTransition`] when the job is already
    /// terminal or failed.
    pub fn cancel(&mut self, reason: impl Into<String>) -> BulkJobResult<()> {
        if !self.status.can_cancel() {
            return Err(BulkJobError::InvalidTransition {
                id: self.id,
                action: "cancel",
                status: self.status,
            });
        }
        self.status = BulkJobStatus::Canceled;
        self.status_message = Some(reason.into());
        self.touch();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> BulkJob {
        BulkJob::new(
            Destination::new("shop.example.com"),
            "{ orders { edges { node { id } } } }",
            "order export",
        )
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            BulkJobStatus::Created,
            BulkJobStatus::Running,
            BulkJobStatus::Completed,
            BulkJobStatus::Failed,
            BulkJobStatus::Canceled,
            BulkJobStatus::TimedOut,
        ] {
            assert_eq!(BulkJobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(BulkJobStatus::parse("paused"), None);
    }

    #[test]
    fn test_new_job_is_created() {
        let job = job();
        assert_eq!(job.status, BulkJobStatus::Created);
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.progress_percentage, 0);
        assert!(job.external_operation_id.is_none());
    }

    #[test]
    fn test_happy_path_created_running_completed() {
        let mut job = job();
        job.mark_running("gid://bulk/op/1");
        assert_eq!(job.status, BulkJobStatus::Running);
        assert_eq!(job.external_operation_id.as_deref(), Some("gid://bulk/op/1"));

        job.complete(Some("https://cdn.example/result.jsonl".to_string()), 100, Some(4096), None);
        assert_eq!(job.status, BulkJobStatus::Completed);
        assert_eq!(job.progress_percentage, 100);
        assert_eq!(job.object_count, 100);
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn test_progress_capped_below_100_while_running() {
        let mut job = job();
        job.mark_running("op-1");

        job.update_progress(500, 500);
        assert_eq!(job.progress_percentage, 99);

        job.update_progress(250, 500);
        assert_eq!(job.progress_percentage, 50);

        // Unknown estimate leaves progress untouched.
        let before = job.progress_percentage;
        job.update_progress(300, 0);
        assert_eq!(job.progress_percentage, before);
        assert_eq!(job.object_count, 300);
    }

    #[test]
    fn test_retry_failed_increments_count_exactly_once() {
        let mut job = job();
        job.mark_running("op-1");
        job.fail(Some("INTERNAL_SERVER_ERROR".to_string()), "boom");

        job.prepare_retry().unwrap();
        assert_eq!(job.status, BulkJobStatus::Created);
        assert_eq!(job.retry_count, 1);
        assert!(job.error_code.is_none());
        assert!(job.error_detail.is_none());
        assert!(job.external_operation_id.is_none());
    }

    #[test]
    fn test_retry_timed_out_allowed() {
        let mut job = job();
        job.mark_running("op-1");
        job.time_out("stalled");
        assert!(job.prepare_retry().is_ok());
        assert_eq!(job.retry_count, 1);
    }

    #[test]
    fn test_retry_completed_rejected() {
        let mut job = job();
        job.mark_running("op-1");
        job.complete(Some("https://cdn.example/r.jsonl".to_string()), 1, None, None);

        let err = job.prepare_retry().unwrap_err();
        assert!(matches!(
            err,
            BulkJobError::InvalidTransition {
                action: "retry",
                status: BulkJobStatus::Completed,
                ..
            }
        ));
        assert_eq!(job.retry_count, 0);
    }

    #[test]
    fn test_cancel_running_allowed() {
        let mut job = job();
        job.mark_running("op-1");
        job.cancel("canceled by user").unwrap();
        assert_eq!(job.status, BulkJobStatus::Canceled);
    }

    #[test]
    fn test_cancel_created_allowed() {
        let mut job = job();
        assert!(job.cancel("canceled before submit").is_ok());
    }

    #[test]
    fn test_cancel_completed_rejected() {
        let mut job = job();
        job.mark_running("op-1");
        job.complete(Some("https://cdn.example/r.jsonl".to_string()), 1, None, None);

        let err = job.cancel("too late").unwrap_err();
        assert!(matches!(
            err,
            BulkJobError::InvalidTransition {
                action: "cancel",
                ..
            }
        ));
    }

    #[test]
    fn test_cancel_canceled_rejected() {
        let mut job = job();
        job.cancel("first").unwrap();
        assert!(job.cancel("second").is_err());
    }
}
