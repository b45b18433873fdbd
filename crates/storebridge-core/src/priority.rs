//! Priority tiers for event processing and outbound call admission.
//!
//! Lower tier numbers are more urgent. The same tiers order both the
//! webhook retry queue and the per-destination connection scheduler, so
//! an order event keeps its urgency all the way to the wire.

use serde::{Deserialize, Serialize};

/// Priority tier. Lower = more urgent.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Order, checkout, and fulfillment flows.
    Orders,
    /// Inventory and customer updates.
    Inventory,
    /// Product catalog and collection changes.
    #[default]
    Catalog,
    /// Everything else: analytics, reporting, bulk exports.
    Background,
}

impl Priority {
    /// Numeric tier used for queue ordering. Lower = more urgent.
    #[must_use]
    pub fn tier(self) -> u8 {
        match self {
            Self::Orders => 1,
            Self::Inventory => 5,
            Self::Catalog => 10,
            Self::Background => 15,
        }
    }

    /// Classify a webhook topic into a priority tier.
    ///
    /// Topics follow the platform's `resource/event` convention
    /// (`orders/create`, `inventory_levels/update`, ...). Unknown topics
    /// land in the background tier.
    #[must_use]
    pub fn for_topic(topic: &str) -> Self {
        let t = topic.to_ascii_lowercase();
        if t.contains("order") || t.contains("checkout") || t.contains("fulfillment") {
            Self::Orders
        } else if t.contains("inventory") || t.contains("customer") {
            Self::Inventory
        } else if t.contains("product") || t.contains("collection") {
            Self::Catalog
        } else {
            Self::Background
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Orders => "orders",
            Self::Inventory => "inventory",
            Self::Catalog => "catalog",
            Self::Background => "background",
        }
    }
}
