//! Inbound webhook path for the external e-commerce platform.
//!
//! Events arrive over HTTP with an HMAC-SHA256 signature, are verified
//! and deduplicated, then admitted to a priority retry scheduler that
//! dispatches them to pluggable topic handlers. Exhausted events land in
//! a dead-letter queue retained for inspection and periodic resweep.

pub mod dedup;
pub mod error;
pub mod event;
pub mod registry;
pub mod router;
pub mod scheduler;
pub mod signature;

pub use dedup::{DedupStore, Deduplicator, DeduplicatorConfig};
pub use error::WebhookError;
pub use event::{InboundEvent, WebhookHeaders};
pub use registry::{EventHandler, HandlerRegistry};
pub use router::{ingest_router, AckPolicy, IngestState};
pub use scheduler::{DeadLetter, EnqueueStatus, RetryConfig, RetryScheduler};
pub use signature::{SignatureConfig, SignatureValidator};
