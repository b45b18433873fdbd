//! Topic-to-handler dispatch table.
//!
//! Business logic per topic is pluggable: implement [`EventHandler`] and
//! register it for the topics it serves. Dispatch has an explicit
//! "no handler" case instead of a catch-all.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use storebridge_core::ProcessingOutcome;

use crate::event::InboundEvent;

/// A pluggable processor for one or more event topics.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Process a validated, unique event.
    ///
    /// Implementations report failures through the outcome; panics are
    /// caught by the scheduler's supervision boundary.
    async fn handle(&self, event: &InboundEvent) -> ProcessingOutcome;
}

/// Registry mapping topics to handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn EventHandler>>>,
}

impl HandlerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for each topic.
    ///
    /// Registering a topic twice keeps the latest registration and logs a
    /// warning - duplicates are never silently dropped.
    pub fn register(&self, topics: &[&str], handler: Arc<dyn EventHandler>) {
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for topic in topics {
            if handlers.insert((*topic).to_string(), handler.clone()).is_some() {
                tracing::warn!(
                    target: "webhook_registry",
                    topic,
                    "Topic registered twice - keeping latest handler"
                );
            }
        }
    }

    /// Look up the handler for a topic.
    #[must_use]
    pub fn dispatch(&self, topic: &str) -> Option<Arc<dyn EventHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(topic)
            .cloned()
    }

    /// Topics with a registered handler, for health and introspection.
    #[must_use]
    pub fn registered_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        topics.sort();
        topics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storebridge_core::{Destination, EventId};

    struct TaggedHandler(&'static str);

    #[async_trait]
    impl EventHandler for TaggedHandler {
        async fn handle(&self, _event: &InboundEvent) -> ProcessingOutcome {
            ProcessingOutcome::success(self.0)
        }
    }

    fn event(topic: &str) -> InboundEvent {
        InboundEvent::new(
            EventId::new("wh-1"),
            topic,
            Destination::new("shop.example.com"),
            b"{}".to_vec(),
            serde_json::json!({}),
        )
    }

    #[tokio::test]
    async fn test_dispatch_registered_topic() {
        let registry = HandlerRegistry::new();
        registry.register(&["orders/create"], Arc::new(TaggedHandler("orders")));

        let handler = registry.dispatch("orders/create").unwrap();
        let outcome = handler.handle(&event("orders/create")).await;
        assert_eq!(outcome.message, "orders");
    }

    #[test]
    fn test_dispatch_unknown_topic_is_none() {
        let registry = HandlerRegistry::new();
        assert!(registry.dispatch("orders/create").is_none());
    }

    #[tokio::test]
    async fn test_duplicate_registration_last_writer_wins() {
        let registry = HandlerRegistry::new();
        registry.register(&["orders/create"], Arc::new(TaggedHandler("first")));
        registry.register(&["orders/create"], Arc::new(TaggedHandler("second")));

        let handler = registry.dispatch("orders/create").unwrap();
        let outcome = handler.handle(&event("orders/create")).await;
        assert_eq!(outcome.message, "second");
    }

    #[test]
    fn test_one_handler_many_topics() {
        let registry = HandlerRegistry::new();
        registry.register(
            &["orders/create", "orders/updated", "orders/cancelled"],
            Arc::new(TaggedHandler("orders")),
        );

        assert_eq!(
            registry.registered_topics(),
            vec!["orders/cancelled", "orders/create", "orders/updated"]
        );
    }
}
