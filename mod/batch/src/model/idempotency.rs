use serde::{Deserialize, Serialize};

/// Lifecycle of an idempotency record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IdempotencyState {
    /// A request holding this key is in flight. Concurrent callers wait.
    Pending,
    /// The first execution finished; `status`/`body` hold its result.
    Done,
}

/// IdempotencyRecord — written at most twice (Pending, then Done) and
/// never afterwards. Expired records are reclaimed by the next caller
/// presenting the same key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IdempotencyRecord {
    /// Fully-scoped key: tenant + operation + client token.
    pub key: String,

    pub state: IdempotencyState,

    /// HTTP status of the first successful execution (Done only).
    #[serde(default)]
    pub status: u16,

    /// Response body of the first successful execution (Done only).
    #[serde(default)]
    pub body: serde_json::Value,

    pub created_at: String,

    /// Unix seconds. Past this instant the record no longer dedupes.
    pub expires_at: i64,
}

impl IdempotencyRecord {
    pub fn is_expired(&self, now_unix: i64) -> bool {
        now_unix >= self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_and_expiry() {
        let rec = IdempotencyRecord {
            key: "idem:org1:move:b1:req-1".into(),
            state: IdempotencyState::Pending,
            status: 0,
            body: serde_json::Value::Null,
            created_at: "2025-06-30T08:00:00+00:00".into(),
            expires_at: 1_751_270_700,
        };
        let back: IdempotencyRecord =
            serde_json::from_str(&serde_json::to_string(&rec).unwrap()).unwrap();
        assert_eq!(rec, back);
        assert!(!rec.is_expired(rec.expires_at - 1));
        assert!(rec.is_expired(rec.expires_at));
    }
}
