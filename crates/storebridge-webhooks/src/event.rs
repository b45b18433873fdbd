//! Inbound event model and the webhook header contract.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use storebridge_core::{Destination, EventId, Priority};

/// Header carrying the base64 HMAC-SHA256 of the raw body.
pub const SIGNATURE_HEADER: &str = "x-commerce-hmac-sha256";
/// Header carrying the originating shop domain.
pub const SOURCE_DOMAIN_HEADER: &str = "x-commerce-shop-domain";
/// Header carrying the event topic (`resource/event`).
pub const TOPIC_HEADER: &str = "x-commerce-topic";
/// Header carrying the signing timestamp (unix seconds or RFC 3339).
pub const TIMESTAMP_HEADER: &str = "x-commerce-timestamp";
/// Header carrying the platform's delivery id (idempotency key).
pub const DELIVERY_ID_HEADER: &str = "x-commerce-webhook-id";

/// Headers extracted from an inbound webhook request.
///
/// All fields are optional at this layer; the signature validator and
/// router decide which absences are fatal.
#[derive(Debug, Clone, Default)]
pub struct WebhookHeaders {
    pub signature: Option<String>,
    pub source_domain: Option<String>,
    pub topic: Option<String>,
    pub timestamp: Option<String>,
    pub delivery_id: Option<String>,
}

/// A validated inbound event admitted to the processing pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    /// Idempotency key (platform delivery id).
    pub id: EventId,
    /// Topic in `resource/event` form.
    pub topic: String,
    /// Originating shop domain.
    pub source_domain: Destination,
    /// Exact signed body bytes.
    pub raw_payload: Vec<u8>,
    /// Parsed form of the payload.
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
    /// Delivery attempts made so far. Monotonic; never reset.
    pub attempts: u32,
    pub priority: Priority,
}

impl InboundEvent {
    /// Build an event from validated request parts.
    ///
    /// Priority is assigned from the topic's static classification.
    #[must_use]
    pub fn new(
        id: EventId,
        topic: impl Into<String>,
        source_domain: Destination,
        raw_payload: Vec<u8>,
        payload: serde_json::Value,
    ) -> Self {
        let topic = topic.into();
        let priority = Priority::for_topic(&topic);
        Self {
            id,
            topic,
            source_domain,
            raw_payload,
            payload,
            received_at: Utc::now(),
            attempts: 0,
            priority,
        }
    }
}
