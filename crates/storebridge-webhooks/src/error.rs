//! Error types for the webhook ingestion path.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Webhook ingestion error variants.
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    /// Signature, source domain, or timestamp check failed. Never retried.
    #[error("Webhook authenticity verification failed")]
    InvalidSignature,

    /// Malformed request (missing headers, unparseable payload).
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// JSON error response returned by the ingest endpoint.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub message: String,
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = match &self {
            WebhookError::InvalidSignature => StatusCode::UNAUTHORIZED,
            WebhookError::Validation(_) => StatusCode::BAD_REQUEST,
            WebhookError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = ErrorResponse {
            success: false,
            message: self.to_string(),
        };

        (status, axum::Json(body)).into_response()
    }
}

pub type WebhookResult<T> = Result<T, WebhookError>;
