//! Error types for bulk job orchestration.

use storebridge_core::JobId;
use storebridge_gateway::GatewayError;

use crate::job::BulkJobStatus;

/// Bulk job error variants.
#[derive(Debug, thiserror::Error)]
pub enum BulkJobError {
    #[error("bulk job not found: {0}")]
    NotFound(JobId),

    /// The requested operation is not legal in the job's current status.
    #[error("cannot {action} job {id} in status {status}")]
    InvalidTransition {
        id: JobId,
        action: &'static str,
        status: BulkJobStatus,
    },

    #[error("polling timed out for job {id} after {attempts} attempts")]
    PollTimeout { id: JobId, attempts: u32 },

    #[error("results not available for job {id} in status {status}")]
    ResultsUnavailable { id: JobId, status: BulkJobStatus },

    #[error("job {id} has no result URL")]
    MissingResultUrl { id: JobId },

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("job store error: {0}")]
    Store(String),
}

pub type BulkJobResult<T> = Result<T, BulkJobError>;
