//! Error taxonomy for outbound platform calls.
//!
//! Classification drives retry policy:
//! - [`GatewayError::Transient`] is retried with backoff,
//! - [`GatewayError::RateLimited`] throttles the destination's budget and
//!   retries after the indicated delay,
//! - [`GatewayError::Permanent`] is surfaced to the caller unretried,
//! - [`GatewayError::CircuitOpen`] is synthetic - raised without touching
//!   the wire while the destination's circuit is open.

use std::time::Duration;

use chrono::{DateTime, Utc};
use storebridge_core::Destination;

/// Outbound call error variants.
///
/// Every variant carries the correlation id (event id, job id, or caller
/// supplied tag) so failures can be traced back through the logs.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("transient failure calling {destination} [{correlation}]: {message}")]
    Transient {
        destination: Destination,
        correlation: String,
        message: String,
    },

    #[error("rate limited by {destination} [{correlation}]")]
    RateLimited {
        destination: Destination,
        correlation: String,
        /// Delay hinted by the destination's retry-after header, if any.
        retry_after: Option<Duration>,
    },

    #[error("permanent failure from {destination} [{correlation}]: HTTP {status}: {message}")]
    Permanent {
        destination: Destination,
        correlation: String,
        status: u16,
        message: String,
    },

    #[error("circuit open for {destination}, next attempt at {retry_at}")]
    CircuitOpen {
        destination: Destination,
        retry_at: DateTime<Utc>,
    },

    #[error("connection scheduler shut down before admission")]
    SchedulerClosed,

    #[error("invalid gateway configuration: {0}")]
    Configuration(String),
}

impl GatewayError {
    /// Whether a caller should retry this failure with backoff.
    ///
    /// Rate-limit errors are retryable too, but on the destination's
    /// schedule rather than the caller's backoff curve.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transient { .. } | Self::RateLimited { .. } | Self::CircuitOpen { .. }
        )
    }

    /// Whether this failure should count toward circuit breaker accounting.
    ///
    /// 429s are excluded: they reflect our own pacing, not destination
    /// unhealthiness. Circuit-open rejections never reach the wire, so
    /// they cannot count either.
    #[must_use]
    pub fn counts_toward_circuit(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::Permanent { .. })
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn dest() -> Destination {
        Destination::new("shop.example.com")
    }

    #[test]
    fn test_transient_is_retryable_and_counted() {
        let err = GatewayError::Transient {
            destination: dest(),
            correlation: "wh-1".into(),
            message: "connection reset".into(),
        };
        assert!(err.is_retryable());
        assert!(err.counts_toward_circuit());
    }

    #[test]
    fn test_rate_limited_excluded_from_circuit() {
        let err = GatewayError::RateLimited {
            destination: dest(),
            correlation: "job-1".into(),
            retry_after: Some(Duration::from_secs(5)),
        };
        assert!(err.is_retryable());
        assert!(!err.counts_toward_circuit());
    }

    #[test]
    fn test_permanent_not_retryable() {
        let err = GatewayError::Permanent {
            destination: dest(),
            correlation: "job-2".into(),
            status: 422,
            message: "invalid query".into(),
        };
        assert!(!err.is_retryable());
        assert!(err.counts_toward_circuit());
    }

    #[test]
    fn test_circuit_open_not_counted() {
        let err = GatewayError::CircuitOpen {
            destination: dest(),
            retry_at: Utc::now(),
        };
        assert!(err.is_retryable());
        assert!(!err.counts_toward_circuit());
    }
}
