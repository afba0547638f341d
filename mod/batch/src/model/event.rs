use serde::{Deserialize, Serialize};

/// Audit event kinds. Wire values are stable; new kinds may be added.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Checkin,
    Move,
    MovePartial,
    TransplantUsed,
    Dump,
    Archive,
    FlagChange,
}

/// BatchEvent — one append-only audit record.
///
/// Never mutated or deleted by this module. For any mutation that
/// changes a batch's quantity, exactly one event carries a signed
/// `delta` in its payload equal to the change applied in the same
/// transaction; replaying all deltas reproduces the current quantity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BatchEvent {
    pub id: String,

    pub batch_id: String,

    pub org_id: String,

    /// Per-batch sequence, assigned inside the write transaction.
    pub seq: u64,

    pub event_type: EventType,

    /// Type-specific structured data. Quantity-changing events include
    /// a signed integer `delta`.
    pub payload: serde_json::Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub by_user_id: Option<String>,

    pub at: String,

    /// The idempotency token of the request that produced this event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl BatchEvent {
    /// The signed quantity delta, or 0 for events that do not change
    /// quantity (MOVE, FLAG_CHANGE).
    pub fn delta(&self) -> i64 {
        self.payload.get("delta").and_then(|v| v.as_i64()).unwrap_or(0)
    }
}
