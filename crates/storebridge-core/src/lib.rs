//! storebridge Core Library
//!
//! Shared types for the storebridge integration core.
//!
//! # Modules
//!
//! - [`ids`] - Strongly typed identifiers (EventId, JobId, Destination)
//! - [`priority`] - Priority tiers and topic classification
//! - [`outcome`] - Processing outcome reported by event handlers

pub mod ids;
pub mod outcome;
pub mod priority;

// Re-export main types for convenient access
pub use ids::{Destination, EventId, JobId};
pub use outcome::ProcessingOutcome;
pub use priority::Priority;
