//! Processing outcome reported by event handlers.

use serde::{Deserialize, Serialize};

/// Result of processing a single inbound event.
///
/// Handlers never propagate panics or raw errors to the ingestion path;
/// every execution collapses into one of these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingOutcome {
    /// Whether the handler applied its effect.
    pub success: bool,
    /// Human-readable summary.
    pub message: String,
    /// Error detail when `success` is false.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProcessingOutcome {
    /// Successful outcome with a summary message.
    #[must_use]
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            error: None,
        }
    }

    /// Failed outcome carrying the error detail.
    #[must_use]
    pub fn failure(message: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            error: Some(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_has_no_error() {
        let outcome = ProcessingOutcome::success("order synced");
        assert!(outcome.success);
        assert!(outcome.error.is_none());
    }

    #[test]
    fn test_failure_preserves_error() {
        let outcome = ProcessingOutcome::failure("sync failed", "connection reset");
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("connection reset"));
    }

    #[test]
    fn test_serialization_skips_none_error() {
        let json = serde_json::to_string(&ProcessingOutcome::success("ok")).unwrap();
        assert!(!json.contains("error"));
    }
}
