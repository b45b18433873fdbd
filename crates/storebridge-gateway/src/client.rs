//! HTTP client for the external platform's admin API.
//!
//! One shared [`reqwest::Client`] serves every destination. Each call is
//! checked against the destination's circuit breaker, admitted by the
//! connection scheduler, then classified into the [`GatewayError`]
//! taxonomy. Call-limit response headers are fed back to the scheduler so
//! its budget tracks what the platform actually reports.

use std::time::{Duration, Instant};

use reqwest::StatusCode;
use serde_json::json;

use storebridge_core::{Destination, Priority};

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::error::{GatewayError, GatewayResult};
use crate::scheduler::ConnectionScheduler;

/// Platform client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Admin API version segment in request URLs.
    pub api_version: String,
    /// Request timeout.
    pub timeout: Duration,
    /// User-agent header value.
    pub user_agent: String,
    /// Response header carrying the destination's call budget as
    /// `used/max`.
    pub call_limit_header: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_version: "2025-01".to_string(),
            timeout: Duration::from_secs(10),
            user_agent: "storebridge/0.4".to_string(),
            call_limit_header: "x-api-call-limit".to_string(),
        }
    }
}

/// Guarded HTTP client for platform API calls.
#[derive(Clone)]
pub struct PlatformClient {
    http: reqwest::Client,
    config: ClientConfig,
    breaker: CircuitBreakerRegistry,
    scheduler: std::sync::Arc<ConnectionScheduler>,
}

impl PlatformClient {
    /// Build the client with its shared HTTP connection pool.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Configuration`] if the HTTP client cannot
    /// be built.
    pub fn new(
        config: ClientConfig,
        breaker: CircuitBreakerRegistry,
        scheduler: std::sync::Arc<ConnectionScheduler>,
    ) -> GatewayResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| GatewayError::Configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            config,
            breaker,
            scheduler,
        })
    }

    /// Execute a GraphQL document against a destination's admin API.
    ///
    /// Returns the response's `data` value. Top-level GraphQL errors are
    /// surfaced as [`GatewayError::Permanent`]: the destination answered,
    /// the request itself was wrong.
    pub async fn graphql(
        &self,
        destination: &Destination,
        access_token: &str,
        query: &str,
        variables: Option<serde_json::Value>,
        priority: Priority,
        correlation: &str,
    ) -> GatewayResult<serde_json::Value> {
        let url = format!(
            "https://{}/admin/api/{}/graphql.json",
            destination, self.config.api_version
        );
        let body = json!({
            "query": query,
            "variables": variables.unwrap_or(serde_json::Value::Null),
        });

        self.breaker
            .execute(destination, || async {
                self.scheduler.admit(destination, priority).await?;

                let start = Instant::now();
                let response = self
                    .http
                    .post(&url)
                    .bearer_auth(access_token)
                    .json(&body)
                    .send()
                    .await
                    .map_err(|e| classify_request_error(destination, correlation, &e))?;
                let latency_ms = start.elapsed().as_millis();

                self.ingest_call_limit(destination, response.headers()).await;

                let status = response.status();
                let retry_after = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_retry_after);
                let text = response.text().await.unwrap_or_default();

                if let Some(err) =
                    classify_status(destination, correlation, status, &text, retry_after)
                {
                    if let GatewayError::RateLimited { retry_after, .. } = &err {
                        self.scheduler.mark_throttled(destination, *retry_after).await;
                    }
                    return Err(err);
                }

                tracing::debug!(
                    target: "platform_client",
                    destination = %destination,
                    correlation,
                    status = status.as_u16(),
                    latency_ms = latency_ms as u64,
                    "GraphQL call completed"
                );

                let parsed: serde_json::Value = serde_json::from_str(&text).map_err(|e| {
                    GatewayError::Transient {
                        destination: destination.clone(),
                        correlation: correlation.to_string(),
                        message: format!("malformed response body: {e}"),
                    }
                })?;

                if let Some(errors) = parsed.get("errors").filter(|e| !e.is_null()) {
                    return Err(GatewayError::Permanent {
                        destination: destination.clone(),
                        correlation: correlation.to_string(),
                        status: status.as_u16(),
                        message: format!("GraphQL errors: {errors}"),
                    });
                }

                Ok(parsed.get("data").cloned().unwrap_or(serde_json::Value::Null))
            })
            .await
    }

    /// Fetch a result file URL, returning the raw response for streaming.
    ///
    /// Bulk result downloads go through the same guards as API calls, at
    /// background priority, attributed to the owning destination.
    pub async fn download(
        &self,
        destination: &Destination,
        url: &str,
        correlation: &str,
    ) -> GatewayResult<reqwest::Response> {
        self.breaker
            .execute(destination, || async {
                self.scheduler
                    .admit(destination, Priority::Background)
                    .await?;

                let response = self
                    .http
                    .get(url)
                    .send()
                    .await
                    .map_err(|e| classify_request_error(destination, correlation, &e))?;

                let status = response.status();
                let retry_after = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_retry_after);

                if let Some(err) = classify_status(destination, correlation, status, "", retry_after)
                {
                    if let GatewayError::RateLimited { retry_after, .. } = &err {
                        self.scheduler.mark_throttled(destination, *retry_after).await;
                    }
                    return Err(err);
                }

                Ok(response)
            })
            .await
    }

    /// Feed a reported call budget back into the scheduler.
    async fn ingest_call_limit(&self, destination: &Destination, headers: &reqwest::header::HeaderMap) {
        if let Some((used, max)) = headers
            .get(self.config.call_limit_header.as_str())
            .and_then(|v| v.to_str().ok())
            .and_then(parse_call_limit)
        {
            self.scheduler.update_quota(destination, used, max).await;
        }
    }
}

/// Classify a transport-level request error. Always transient: the
/// destination never answered.
fn classify_request_error(
    destination: &Destination,
    correlation: &str,
    error: &reqwest::Error,
) -> GatewayError {
    let message = if error.is_timeout() {
        "request timeout".to_string()
    } else if error.is_connect() {
        format!("connection failed: {error}")
    } else {
        format!("request error: {error}")
    };

    GatewayError::Transient {
        destination: destination.clone(),
        correlation: correlation.to_string(),
        message,
    }
}

/// Classify a response status into the error taxonomy.
///
/// Returns `None` for success statuses. 429 maps to `RateLimited`, other
/// 4xx to `Permanent`, everything else non-2xx to `Transient`.
fn classify_status(
    destination: &Destination,
    correlation: &str,
    status: StatusCode,
    body: &str,
    retry_after: Option<Duration>,
) -> Option<GatewayError> {
    if status.is_success() {
        return None;
    }

    let message = body.chars().take(512).collect::<String>();

    Some(if status == StatusCode::TOO_MANY_REQUESTS {
        GatewayError::RateLimited {
            destination: destination.clone(),
            correlation: correlation.to_string(),
            retry_after,
        }
    } else if status.is_client_error() {
        GatewayError::Permanent {
            destination: destination.clone(),
            correlation: correlation.to_string(),
            status: status.as_u16(),
            message,
        }
    } else {
        GatewayError::Transient {
            destination: destination.clone(),
            correlation: correlation.to_string(),
            message: format!("HTTP {}: {message}", status.as_u16()),
        }
    })
}

/// Parse a retry-after header value in delay-seconds form.
///
/// HTTP-date form is rare on this platform and ignored; callers fall back
/// to the scheduler's default throttle.
#[must_use]
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
        .or_else(|| {
            value
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|s| *s >= 0.0)
                .map(Duration::from_secs_f64)
        })
}

/// Parse a `used/max` call-limit header value.
#[must_use]
pub fn parse_call_limit(value: &str) -> Option<(u32, u32)> {
    let (used, max) = value.split_once('/')?;
    Some((used.trim().parse().ok()?, max.trim().parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dest() -> Destination {
        Destination::new("shop.example.com")
    }

    #[test]
    fn test_parse_retry_after_seconds() {
        assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
        assert_eq!(parse_retry_after("0"), Some(Duration::from_secs(0)));
        assert_eq!(parse_retry_after(" 5 "), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_parse_retry_after_fractional() {
        assert_eq!(parse_retry_after("2.5"), Some(Duration::from_secs_f64(2.5)));
    }

    #[test]
    fn test_parse_retry_after_invalid() {
        assert_eq!(parse_retry_after("soon"), None);
        assert_eq!(parse_retry_after(""), None);
        assert_eq!(parse_retry_after("-1"), None);
    }

    #[test]
    fn test_parse_call_limit() {
        assert_eq!(parse_call_limit("32/40"), Some((32, 40)));
        assert_eq!(parse_call_limit(" 1 / 80 "), Some((1, 80)));
        assert_eq!(parse_call_limit("40"), None);
        assert_eq!(parse_call_limit("a/b"), None);
    }

    #[test]
    fn test_classify_success_is_none() {
        assert!(classify_status(&dest(), "c", StatusCode::OK, "", None).is_none());
        assert!(classify_status(&dest(), "c", StatusCode::CREATED, "", None).is_none());
    }

    #[test]
    fn test_classify_429_carries_retry_after() {
        let err = classify_status(
            &dest(),
            "job-1",
            StatusCode::TOO_MANY_REQUESTS,
            "",
            Some(Duration::from_secs(7)),
        )
        .unwrap();
        match err {
            GatewayError::RateLimited { retry_after, .. } => {
                assert_eq!(retry_after, Some(Duration::from_secs(7)));
            }
            other => panic!("expected RateLimited, got {other}"),
        }
    }

    #[test]
    fn test_classify_4xx_permanent() {
        let err =
            classify_status(&dest(), "c", StatusCode::UNPROCESSABLE_ENTITY, "bad query", None)
                .unwrap();
        assert!(matches!(err, GatewayError::Permanent { status: 422, .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_classify_5xx_transient() {
        let err = classify_status(&dest(), "c", StatusCode::BAD_GATEWAY, "", None).unwrap();
        assert!(matches!(err, GatewayError::Transient { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_client_config_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(10));
        assert_eq!(config.api_version, "2025-01");
    }
}
