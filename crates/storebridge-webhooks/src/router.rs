//! HTTP ingest endpoint for platform webhooks.
//!
//! The transport contract is deliberate: once a request is authentic, the
//! endpoint acknowledges `200 {success, message}` and hands the event to
//! the retry scheduler - internal processing failures are retried and
//! dead-lettered instead of surfacing as non-200 statuses, which would
//! trigger platform redelivery storms. Transport-level success therefore
//! does not imply business success. [`AckPolicy`] makes this configurable
//! for deployments that want the platform to redeliver.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde::Serialize;

use storebridge_core::{Destination, EventId};

use crate::error::WebhookError;
use crate::event::{
    InboundEvent, WebhookHeaders, DELIVERY_ID_HEADER, SIGNATURE_HEADER, SOURCE_DOMAIN_HEADER,
    TIMESTAMP_HEADER, TOPIC_HEADER,
};
use crate::scheduler::{EnqueueStatus, RetryScheduler};
use crate::signature::SignatureValidator;

/// How the endpoint responds once a request is authentic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckPolicy {
    /// Always acknowledge 200; failures are queued for retry internally.
    #[default]
    AlwaysAck,
    /// Surface synchronous admission errors (malformed payloads) as
    /// non-200 so the platform redelivers.
    SurfaceErrors,
}

/// Shared state behind the ingest router.
#[derive(Clone)]
pub struct IngestState {
    pub validator: Arc<SignatureValidator>,
    pub scheduler: RetryScheduler,
    pub ack_policy: AckPolicy,
}

/// Acknowledgment body returned to the platform.
#[derive(Debug, Serialize)]
struct AckResponse {
    success: bool,
    message: String,
}

/// Build the ingest router: `POST /webhooks`.
pub fn ingest_router(state: IngestState) -> Router {
    Router::new()
        .route("/webhooks", post(receive_webhook))
        .with_state(state)
}

fn extract_headers(headers: &HeaderMap) -> WebhookHeaders {
    let get = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    WebhookHeaders {
        signature: get(SIGNATURE_HEADER),
        source_domain: get(SOURCE_DOMAIN_HEADER),
        topic: get(TOPIC_HEADER),
        timestamp: get(TIMESTAMP_HEADER),
        delivery_id: get(DELIVERY_ID_HEADER),
    }
}

async fn receive_webhook(
    State(state): State<IngestState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let webhook_headers = extract_headers(&headers);

    // Authenticity failures are rejected outright, never enqueued.
    if !state.validator.verify(&body, &webhook_headers) {
        return WebhookError::InvalidSignature.into_response();
    }

    let Some(topic) = webhook_headers.topic.clone() else {
        return reject(
            &state,
            WebhookError::Validation("missing topic header".to_string()),
        );
    };
    // Verified by the validator above.
    let source_domain = webhook_headers.source_domain.clone().unwrap_or_default();

    // The delivery id is optional; without one each delivery is treated
    // as distinct (no dedup possible).
    let event_id = webhook_headers
        .delivery_id
        .clone()
        .map_or_else(|| EventId::new(uuid::Uuid::new_v4().to_string()), EventId::new);

    let payload: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(
                target: "webhook_ingest",
                event_id = %event_id,
                topic = %topic,
                error = %e,
                "Rejecting webhook with unparseable payload"
            );
            return reject(
                &state,
                WebhookError::Validation(format!("unparseable payload: {e}")),
            );
        }
    };

    let event = InboundEvent::new(
        event_id.clone(),
        topic.clone(),
        Destination::new(source_domain),
        body.to_vec(),
        payload,
    );

    let message = match state.scheduler.enqueue(event).await {
        EnqueueStatus::Queued => {
            tracing::info!(
                target: "webhook_ingest",
                event_id = %event_id,
                topic = %topic,
                "Webhook accepted"
            );
            "event accepted".to_string()
        }
        EnqueueStatus::DuplicatePending => "duplicate delivery - already pending".to_string(),
        EnqueueStatus::AlreadyProcessed => "duplicate delivery - already processed".to_string(),
    };

    (
        axum::http::StatusCode::OK,
        Json(AckResponse {
            success: true,
            message,
        }),
    )
        .into_response()
}

/// Apply the ack policy to a synchronous admission error.
fn reject(state: &IngestState, error: WebhookError) -> Response {
    match state.ack_policy {
        AckPolicy::SurfaceErrors => error.into_response(),
        AckPolicy::AlwaysAck => {
            // Acknowledged but recorded: the platform will not redeliver.
            tracing::warn!(
                target: "webhook_ingest",
                error = %error,
                "Acknowledging malformed webhook per ack policy"
            );
            (
                axum::http::StatusCode::OK,
                Json(AckResponse {
                    success: false,
                    message: error.to_string(),
                }),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::{Deduplicator, DeduplicatorConfig};
    use crate::registry::{EventHandler, HandlerRegistry};
    use crate::scheduler::RetryConfig;
    use crate::signature::{compute_signature, SignatureConfig};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use storebridge_core::ProcessingOutcome;
    use tower::ServiceExt;

    const SECRET: &str = "test-secret";

    struct OkHandler;

    #[async_trait]
    impl EventHandler for OkHandler {
        async fn handle(&self, _event: &InboundEvent) -> ProcessingOutcome {
            ProcessingOutcome::success("ok")
        }
    }

    fn make_state(ack_policy: AckPolicy) -> IngestState {
        let registry = Arc::new(HandlerRegistry::new());
        registry.register(&["orders/create"], Arc::new(OkHandler));
        let dedup = Arc::new(Deduplicator::new(DeduplicatorConfig::default()));
        IngestState {
            validator: Arc::new(SignatureValidator::new(SignatureConfig::new(
                SECRET,
                ".myplatform.com",
            ))),
            scheduler: RetryScheduler::new(RetryConfig::default(), registry, dedup),
            ack_policy,
        }
    }

    fn signed_request(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/webhooks")
            .header(SIGNATURE_HEADER, compute_signature(SECRET, body.as_bytes()))
            .header(SOURCE_DOMAIN_HEADER, "alpine-goods.myplatform.com")
            .header(TOPIC_HEADER, "orders/create")
            .header(DELIVERY_ID_HEADER, "wh-123")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_valid_webhook_acknowledged() {
        let app = ingest_router(make_state(AckPolicy::default()));
        let response = app.oneshot(signed_request(r#"{"id":1001}"#)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_bad_signature_rejected_401() {
        let app = ingest_router(make_state(AckPolicy::default()));
        let request = Request::builder()
            .method("POST")
            .uri("/webhooks")
            .header(SIGNATURE_HEADER, "bm90LWEtcmVhbC1zaWduYXR1cmU=")
            .header(SOURCE_DOMAIN_HEADER, "alpine-goods.myplatform.com")
            .header(TOPIC_HEADER, "orders/create")
            .body(Body::from("{}"))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_missing_signature_rejected() {
        let app = ingest_router(make_state(AckPolicy::default()));
        let request = Request::builder()
            .method("POST")
            .uri("/webhooks")
            .header(SOURCE_DOMAIN_HEADER, "alpine-goods.myplatform.com")
            .header(TOPIC_HEADER, "orders/create")
            .body(Body::from("{}"))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_malformed_payload_acknowledged_under_always_ack() {
        let app = ingest_router(make_state(AckPolicy::AlwaysAck));
        let response = app.oneshot(signed_request("not json")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_malformed_payload_surfaced_under_strict_policy() {
        let app = ingest_router(make_state(AckPolicy::SurfaceErrors));
        let response = app.oneshot(signed_request("not json")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_redelivery_still_acknowledged_200() {
        let state = make_state(AckPolicy::default());
        let app = ingest_router(state.clone());

        let first = app
            .clone()
            .oneshot(signed_request(r#"{"id":1001}"#))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        // Same delivery id again: still 200, not double-enqueued.
        let second = app.oneshot(signed_request(r#"{"id":1001}"#)).await.unwrap();
        assert_eq!(second.status(), StatusCode::OK);
        assert_eq!(state.scheduler.queue_len().await, 1);
    }
}
