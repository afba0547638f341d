//! Append-only audit log.
//!
//! Events are inserted inside the same write transaction as the state
//! change they describe and never updated or deleted here; retention is
//! an external concern. History order comes from a per-batch sequence
//! baked into the key, so a prefix scan returns append order.

use potline_core::{ServiceError, new_id, now_rfc3339};
use potline_kv::WriteTxn;
use serde::Serialize;

use super::{Actor, BatchService, codec_err, event_key, event_seq_key, store_err};
use crate::model::{BatchEvent, EventType};

/// Result of replaying a batch's event deltas against its current
/// quantity. `consistent` is false when the two disagree — either a
/// data-integrity problem or one of the documented clamping paths.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reconciliation {
    pub batch_id: String,
    pub replayed: i64,
    pub current: u32,
    pub consistent: bool,
}

impl BatchService {
    /// Append one audit event inside `txn`. Assigns the next per-batch
    /// sequence; both the counter bump and the event insert commit (or
    /// roll back) with the enclosing mutation.
    pub(crate) fn append_event(
        txn: &mut dyn WriteTxn,
        org: &str,
        batch_id: &str,
        event_type: EventType,
        payload: serde_json::Value,
        actor: &Actor,
    ) -> Result<BatchEvent, ServiceError> {
        let seq_key = event_seq_key(org, batch_id);
        let seq = match txn.get(&seq_key).map_err(store_err)? {
            Some(raw) => {
                let bytes: [u8; 8] = raw.as_slice().try_into().map_err(|_| {
                    ServiceError::Internal(format!("corrupt event counter {}", seq_key))
                })?;
                u64::from_be_bytes(bytes) + 1
            }
            None => 1,
        };
        txn.set(&seq_key, &seq.to_be_bytes()).map_err(store_err)?;

        let event = BatchEvent {
            id: new_id(),
            batch_id: batch_id.to_string(),
            org_id: org.to_string(),
            seq,
            event_type,
            payload,
            by_user_id: actor.user_id.clone(),
            at: now_rfc3339(),
            request_id: actor.request_id.clone(),
        };
        let data = serde_json::to_vec(&event).map_err(codec_err)?;
        txn.set(&event_key(org, batch_id, seq), &data)
            .map_err(store_err)?;
        Ok(event)
    }

    /// Event history for one batch, in append order.
    pub fn history(&self, org: &str, batch_id: &str) -> Result<Vec<BatchEvent>, ServiceError> {
        // 404 for an unknown batch rather than an empty history.
        self.get_batch(org, batch_id)?;

        let entries = self
            .kv
            .scan(&format!("event:{}:{}:", org, batch_id))
            .map_err(store_err)?;
        let mut events = Vec::with_capacity(entries.len());
        for (_key, data) in entries {
            events.push(serde_json::from_slice(&data).map_err(codec_err)?);
        }
        Ok(events)
    }

    /// Replay the signed deltas of all events for a batch and compare
    /// against its current quantity.
    pub fn reconcile(&self, org: &str, batch_id: &str) -> Result<Reconciliation, ServiceError> {
        let batch = self.get_batch(org, batch_id)?;
        let events = self.history(org, batch_id)?;
        let replayed: i64 = events.iter().map(BatchEvent::delta).sum();
        Ok(Reconciliation {
            batch_id: batch_id.to_string(),
            replayed,
            current: batch.quantity,
            consistent: replayed == i64::from(batch.quantity),
        })
    }
}
