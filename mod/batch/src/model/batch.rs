use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Production phase. The leading digit of a sequential batch number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Propagation,
    Plugs,
    Potting,
}

impl Phase {
    /// The digit this phase contributes to a batch number.
    pub fn digit(self) -> u8 {
        match self {
            Phase::Propagation => 1,
            Phase::Plugs => 2,
            Phase::Potting => 3,
        }
    }

    pub fn from_digit(d: u8) -> Option<Self> {
        match d {
            1 => Some(Phase::Propagation),
            2 => Some(Phase::Plugs),
            3 => Some(Phase::Potting),
            _ => None,
        }
    }
}

/// Batch lifecycle status. `growing → ready → {sold, archived}`;
/// sold and archived are terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    #[default]
    Growing,
    Ready,
    Sold,
    Archived,
}

/// Batch — a cohort of plants under unified handling.
///
/// `quantity` is the canonical current count; the event stream is an
/// audit record replayed only for reconciliation. `initial_quantity` is
/// the immutable snapshot taken at creation. `transplanted_from` is the
/// primary lineage edge written by splits and transplants.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Batch {
    /// UUID primary key (tenant-unique).
    #[serde(default)]
    pub id: String,

    /// Tenant id. Every storage key and predicate is scoped by it.
    pub org_id: String,

    /// Human-readable batch number, unique per tenant.
    /// Sequential scheme `1-2527-00001`, or legacy `B-2025-x3k9p`.
    pub batch_number: String,

    pub phase: Phase,

    #[serde(default)]
    pub status: BatchStatus,

    /// Current quantity. Never negative; may exceed `initial_quantity`
    /// after subsequent intake.
    pub quantity: u32,

    /// Quantity at creation. Immutable.
    pub initial_quantity: u32,

    pub location_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supplier_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variety: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,

    /// The batch this one was split or transplanted from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transplanted_from: Option<String>,

    /// Named boolean/enum/number attributes, independent of quantity.
    /// Changes are audited as FLAG_CHANGE events.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub flags: BTreeMap<String, serde_json::Value>,

    #[serde(default)]
    pub created_at: String,

    #[serde(default)]
    pub updated_at: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<String>,
}

impl Batch {
    pub fn is_archived(&self) -> bool {
        self.status == BatchStatus::Archived
    }
}
