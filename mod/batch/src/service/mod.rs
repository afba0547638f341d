pub mod ancestry;
pub mod audit;
pub mod flags;
pub mod idempotency;
pub mod ledger;
pub mod number;

use std::sync::Arc;

use potline_core::{ListParams, ListResult, ServiceError};
use potline_kv::{KVError, KVStore, WriteTxn};
use serde::Deserialize;

use crate::model::Batch;

/// Batch service — the quantity ledger and everything derived from it.
///
/// All mutations run inside a single kv write transaction: reads of the
/// batches involved, validation, record updates, and audit-event appends
/// either all commit or all roll back. The store serializes writers, so
/// counter increments and conditional inserts inside a transaction are
/// atomic without extra locking.
pub struct BatchService {
    pub(crate) kv: Arc<dyn KVStore>,
}

/// Who performed a mutation, and under which idempotency token.
/// Stamped onto every audit event.
#[derive(Debug, Clone, Default)]
pub struct Actor {
    pub user_id: Option<String>,
    pub request_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchFilters {
    pub status: Option<String>,
    pub phase: Option<String>,
    pub location_id: Option<String>,
}

// ── Storage keys ────────────────────────────────────────────────────
//
// Namespaced, tenant-scoped. The tenant extractor rejects org ids
// containing the `:` delimiter, so prefixes never bleed across tenants.

pub(crate) fn batch_key(org: &str, id: &str) -> String {
    format!("batch:{}:{}", org, id)
}

pub(crate) fn batch_number_key(org: &str, number: &str) -> String {
    format!("batchno:{}:{}", org, number)
}

pub(crate) fn event_key(org: &str, batch_id: &str, seq: u64) -> String {
    format!("event:{}:{}:{:010}", org, batch_id, seq)
}

pub(crate) fn event_seq_key(org: &str, batch_id: &str) -> String {
    format!("eventseq:{}:{}", org, batch_id)
}

pub(crate) fn idem_key(org: &str, scope: &str, token: &str) -> String {
    format!("idem:{}:{}:{}", org, scope, token)
}

pub(crate) fn store_err(e: KVError) -> ServiceError {
    ServiceError::Storage(e.to_string())
}

pub(crate) fn codec_err(e: serde_json::Error) -> ServiceError {
    ServiceError::Internal(e.to_string())
}

impl BatchService {
    pub fn new(kv: Arc<dyn KVStore>) -> Self {
        Self { kv }
    }

    // ── Reads (outside any write transaction) ──

    pub fn get_batch(&self, org: &str, id: &str) -> Result<Batch, ServiceError> {
        let data = self
            .kv
            .get(&batch_key(org, id))
            .map_err(store_err)?
            .ok_or_else(|| ServiceError::NotFound(format!("batch {} not found", id)))?;
        serde_json::from_slice(&data).map_err(codec_err)
    }

    pub fn list_batches(
        &self,
        org: &str,
        params: &ListParams,
        filters: &BatchFilters,
    ) -> Result<ListResult<Batch>, ServiceError> {
        let entries = self
            .kv
            .scan(&format!("batch:{}:", org))
            .map_err(store_err)?;

        let mut batches: Vec<Batch> = Vec::with_capacity(entries.len());
        for (_key, data) in entries {
            batches.push(serde_json::from_slice(&data).map_err(codec_err)?);
        }

        if let Some(ref status) = filters.status {
            let want = status.to_uppercase();
            batches.retain(|b| {
                serde_json::to_value(b.status)
                    .ok()
                    .and_then(|v| v.as_str().map(String::from))
                    .is_some_and(|s| s == want)
            });
        }
        if let Some(ref phase) = filters.phase {
            let want = phase.to_uppercase();
            batches.retain(|b| {
                serde_json::to_value(b.phase)
                    .ok()
                    .and_then(|v| v.as_str().map(String::from))
                    .is_some_and(|s| s == want)
            });
        }
        if let Some(ref loc) = filters.location_id {
            batches.retain(|b| &b.location_id == loc);
        }

        batches.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let total = batches.len();
        let limit = params.limit.min(500);
        let items = batches
            .into_iter()
            .skip(params.offset)
            .take(limit)
            .collect();

        Ok(ListResult { items, total })
    }

    // ── Transactional helpers ──

    /// Read a batch inside a write transaction. All mutations read
    /// through this so no stale snapshot can seed a write.
    pub(crate) fn txn_read_batch(
        txn: &dyn WriteTxn,
        org: &str,
        id: &str,
    ) -> Result<Batch, ServiceError> {
        let data = txn
            .get(&batch_key(org, id))
            .map_err(store_err)?
            .ok_or_else(|| ServiceError::NotFound(format!("batch {} not found", id)))?;
        serde_json::from_slice(&data).map_err(codec_err)
    }

    pub(crate) fn txn_write_batch(
        txn: &mut dyn WriteTxn,
        batch: &Batch,
    ) -> Result<(), ServiceError> {
        let data = serde_json::to_vec(batch).map_err(codec_err)?;
        txn.set(&batch_key(&batch.org_id, &batch.id), &data)
            .map_err(store_err)
    }

    /// Register a batch number in the per-tenant unique index. Fails
    /// with a conflict if the number is already taken.
    pub(crate) fn txn_claim_number(
        txn: &mut dyn WriteTxn,
        org: &str,
        number: &str,
        batch_id: &str,
    ) -> Result<(), ServiceError> {
        let key = batch_number_key(org, number);
        if txn.get(&key).map_err(store_err)?.is_some() {
            return Err(ServiceError::Conflict(format!(
                "batch number {} already exists",
                number
            )));
        }
        txn.set(&key, batch_id.as_bytes()).map_err(store_err)
    }
}
