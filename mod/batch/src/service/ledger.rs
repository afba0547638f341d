//! The ledger transactions: check-in, move/split, transplant, dump,
//! archive.
//!
//! Every operation opens one write transaction, reads the batches it
//! touches inside it, validates before writing, appends the matching
//! audit events, and commits last. A failed validation or storage error
//! drops the transaction, so no batch is ever left half-updated and no
//! sequence number is burned.
//!
//! Quantity rules: a split conserves quantity exactly
//! (`parent_after + child == parent_before`); dump rejects over-draw
//! with a conflict; transplant clamps source consumption at zero — the
//! event then records both the requested and the applied units, and its
//! delta is the applied change, so replay still balances.

use chrono::Utc;
use potline_core::{ServiceError, new_id, now_rfc3339};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use super::{Actor, BatchService, number};
use crate::model::{Batch, BatchStatus, EventType, Phase};

// ── Inputs and outcomes ─────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckinInput {
    pub phase: Phase,
    pub quantity: u32,
    pub location_id: String,
    #[serde(default)]
    pub supplier_id: Option<String>,
    #[serde(default)]
    pub variety: Option<String>,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveInput {
    pub destination: String,
    /// Units to move. Absent means the whole batch.
    #[serde(default)]
    pub quantity: Option<u32>,
    /// Set the `spaced` flag on the moved material (the batch itself on
    /// a full move, the child on a split). Recorded as a FLAG_CHANGE in
    /// the same transaction.
    #[serde(default)]
    pub spaced: Option<bool>,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MoveOutcome {
    pub moved_all: bool,
    pub new_batch_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransplantSource {
    pub batch_id: String,
    pub units_used: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransplantInput {
    /// One or two source batches to consume from.
    pub sources: Vec<TransplantSource>,
    pub new_batch: CheckinInput,
    /// Archive the primary source after consumption. Leaves its
    /// remaining quantity untouched, unlike the dedicated archive.
    #[serde(default)]
    pub archive_remainder: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransplantOutcome {
    pub id: String,
    pub batch_number: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DumpInput {
    pub units: u32,
    pub reason: String,
    // Alias for clients still sending the snake_case form.
    #[serde(default = "default_true", alias = "archive_if_empty")]
    pub archive_if_empty: bool,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DumpOutcome {
    pub new_quantity: u32,
}

// ── Operations ──────────────────────────────────────────────────────

impl BatchService {
    /// Create a batch from intake. Allocates a sequential number and
    /// appends the CHECKIN event in the same transaction.
    pub fn checkin(
        &self,
        org: &str,
        input: CheckinInput,
        actor: &Actor,
    ) -> Result<Batch, ServiceError> {
        if input.quantity == 0 {
            return Err(ServiceError::Validation("quantity must be > 0".into()));
        }
        if input.location_id.is_empty() {
            return Err(ServiceError::Validation("locationId must not be empty".into()));
        }

        let mut txn = self.kv.begin().map_err(super::store_err)?;
        let batch_number = number::generate(txn.as_mut(), org, input.phase, Utc::now())?;
        let now = now_rfc3339();
        let batch = Batch {
            id: new_id(),
            org_id: org.to_string(),
            batch_number: batch_number.clone(),
            phase: input.phase,
            status: BatchStatus::Growing,
            quantity: input.quantity,
            initial_quantity: input.quantity,
            location_id: input.location_id,
            supplier_id: input.supplier_id,
            variety: input.variety,
            size: input.size,
            transplanted_from: None,
            flags: Default::default(),
            created_at: now.clone(),
            updated_at: now,
            archived_at: None,
        };

        Self::txn_claim_number(txn.as_mut(), org, &batch_number, &batch.id)?;
        Self::txn_write_batch(txn.as_mut(), &batch)?;
        Self::append_event(
            txn.as_mut(),
            org,
            &batch.id,
            EventType::Checkin,
            json!({
                "delta": i64::from(batch.quantity),
                "origin": "checkin",
                "supplierId": batch.supplier_id,
                "note": input.note,
            }),
            actor,
        )?;
        txn.commit().map_err(super::store_err)?;

        info!(org, batch = %batch.id, number = %batch.batch_number, "batch checked in");
        Ok(batch)
    }

    /// Move a batch (or part of it) to another location.
    ///
    /// A full move only relocates. A partial move is a split: it carves
    /// a child batch out of the parent's quantity, conserving the total
    /// (`parent_after + moved == parent_before`), and links the child
    /// back via `transplanted_from`.
    pub fn move_batch(
        &self,
        org: &str,
        batch_id: &str,
        input: MoveInput,
        actor: &Actor,
    ) -> Result<MoveOutcome, ServiceError> {
        if input.destination.is_empty() {
            return Err(ServiceError::Validation("destination must not be empty".into()));
        }

        let mut txn = self.kv.begin().map_err(super::store_err)?;
        let mut batch = Self::txn_read_batch(txn.as_ref(), org, batch_id)?;
        if batch.is_archived() {
            return Err(ServiceError::Conflict(format!(
                "batch {} is archived",
                batch_id
            )));
        }

        let all = batch.quantity;
        let qty = input.quantity.unwrap_or(all);
        if qty == 0 {
            return Err(ServiceError::Validation("quantity must be > 0".into()));
        }
        if qty > all {
            return Err(ServiceError::Validation(format!(
                "cannot move {} units, batch has {}",
                qty, all
            )));
        }

        if qty == all {
            let from = std::mem::replace(&mut batch.location_id, input.destination.clone());
            batch.updated_at = now_rfc3339();
            let spaced_old = input
                .spaced
                .map(|s| batch.flags.insert("spaced".to_string(), json!(s)));
            Self::txn_write_batch(txn.as_mut(), &batch)?;
            Self::append_event(
                txn.as_mut(),
                org,
                batch_id,
                EventType::Move,
                json!({
                    "from": from,
                    "to": input.destination,
                    "quantity": all,
                    "note": input.note,
                }),
                actor,
            )?;
            if let Some(old) = spaced_old {
                Self::append_event(
                    txn.as_mut(),
                    org,
                    batch_id,
                    EventType::FlagChange,
                    json!({
                        "key": "spaced",
                        "old": old,
                        "new": input.spaced,
                        "reason": input.note,
                    }),
                    actor,
                )?;
            }
            txn.commit().map_err(super::store_err)?;
            info!(org, batch = batch_id, to = %batch.location_id, "batch moved");
            return Ok(MoveOutcome { moved_all: true, new_batch_id: None });
        }

        // Partial move: split off a child batch.
        let child_number = number::generate(txn.as_mut(), org, batch.phase, Utc::now())?;
        let now = now_rfc3339();
        let mut child_flags = std::collections::BTreeMap::new();
        if let Some(s) = input.spaced {
            child_flags.insert("spaced".to_string(), json!(s));
        }
        let child = Batch {
            id: new_id(),
            org_id: org.to_string(),
            batch_number: child_number.clone(),
            phase: batch.phase,
            status: batch.status,
            quantity: qty,
            initial_quantity: qty,
            location_id: input.destination.clone(),
            supplier_id: batch.supplier_id.clone(),
            variety: batch.variety.clone(),
            size: batch.size.clone(),
            transplanted_from: Some(batch.id.clone()),
            flags: child_flags,
            created_at: now.clone(),
            updated_at: now.clone(),
            archived_at: None,
        };

        batch.quantity = all - qty;
        batch.updated_at = now;
        Self::txn_claim_number(txn.as_mut(), org, &child_number, &child.id)?;
        Self::txn_write_batch(txn.as_mut(), &batch)?;
        Self::txn_write_batch(txn.as_mut(), &child)?;
        Self::append_event(
            txn.as_mut(),
            org,
            batch_id,
            EventType::MovePartial,
            json!({
                "delta": -i64::from(qty),
                "to": input.destination,
                "newBatchId": child.id,
                "quantityBefore": all,
                "quantityAfter": batch.quantity,
                "note": input.note,
            }),
            actor,
        )?;
        Self::append_event(
            txn.as_mut(),
            org,
            &child.id,
            EventType::Checkin,
            json!({
                "delta": i64::from(qty),
                "origin": "split",
                "fromBatchId": batch.id,
                "note": input.note,
            }),
            actor,
        )?;
        if let Some(s) = input.spaced {
            Self::append_event(
                txn.as_mut(),
                org,
                &child.id,
                EventType::FlagChange,
                json!({
                    "key": "spaced",
                    "old": null,
                    "new": s,
                    "reason": input.note,
                }),
                actor,
            )?;
        }
        txn.commit().map_err(super::store_err)?;

        info!(org, parent = batch_id, child = %child.id, qty, "batch split");
        Ok(MoveOutcome { moved_all: false, new_batch_id: Some(child.id) })
    }

    /// Transplant: consume from one or two sources into a new batch.
    ///
    /// Source consumption clamps at zero instead of rejecting — a field
    /// crew can pot up more plugs than the ledger thought were left.
    /// The event records requested vs. applied units so the gap stays
    /// visible. The new batch's row stores the primary source as its
    /// parent; the second source's lineage is carried by its
    /// TRANSPLANT_USED event.
    pub fn transplant(
        &self,
        org: &str,
        input: TransplantInput,
        actor: &Actor,
    ) -> Result<TransplantOutcome, ServiceError> {
        if input.sources.is_empty() || input.sources.len() > 2 {
            return Err(ServiceError::Validation(
                "transplant takes 1 or 2 source batches".into(),
            ));
        }
        if input.new_batch.quantity == 0 {
            return Err(ServiceError::Validation("produced quantity must be > 0".into()));
        }
        if input.new_batch.location_id.is_empty() {
            return Err(ServiceError::Validation("locationId must not be empty".into()));
        }
        for s in &input.sources {
            if s.units_used == 0 {
                return Err(ServiceError::Validation(format!(
                    "unitsUsed for source {} must be > 0",
                    s.batch_id
                )));
            }
        }

        let mut txn = self.kv.begin().map_err(super::store_err)?;
        let new_batch_id = new_id();
        let now = now_rfc3339();

        for source in &input.sources {
            let mut src = Self::txn_read_batch(txn.as_ref(), org, &source.batch_id)?;
            if src.is_archived() {
                return Err(ServiceError::Conflict(format!(
                    "source batch {} is archived",
                    source.batch_id
                )));
            }
            let applied = source.units_used.min(src.quantity);
            src.quantity -= applied;
            src.updated_at = now.clone();
            Self::txn_write_batch(txn.as_mut(), &src)?;
            Self::append_event(
                txn.as_mut(),
                org,
                &source.batch_id,
                EventType::TransplantUsed,
                json!({
                    "delta": -i64::from(applied),
                    "unitsRequested": source.units_used,
                    "unitsApplied": applied,
                    "newBatchId": new_batch_id,
                    "quantityAfter": src.quantity,
                }),
                actor,
            )?;
        }

        let batch_number =
            number::generate(txn.as_mut(), org, input.new_batch.phase, Utc::now())?;
        let created = Batch {
            id: new_batch_id.clone(),
            org_id: org.to_string(),
            batch_number: batch_number.clone(),
            phase: input.new_batch.phase,
            status: BatchStatus::Growing,
            quantity: input.new_batch.quantity,
            initial_quantity: input.new_batch.quantity,
            location_id: input.new_batch.location_id.clone(),
            supplier_id: input.new_batch.supplier_id.clone(),
            variety: input.new_batch.variety.clone(),
            size: input.new_batch.size.clone(),
            transplanted_from: Some(input.sources[0].batch_id.clone()),
            flags: Default::default(),
            created_at: now.clone(),
            updated_at: now.clone(),
            archived_at: None,
        };
        Self::txn_claim_number(txn.as_mut(), org, &batch_number, &created.id)?;
        Self::txn_write_batch(txn.as_mut(), &created)?;
        Self::append_event(
            txn.as_mut(),
            org,
            &created.id,
            EventType::Checkin,
            json!({
                "delta": i64::from(created.quantity),
                "origin": "transplant",
                "sourceBatchIds": input.sources.iter()
                    .map(|s| s.batch_id.clone())
                    .collect::<Vec<_>>(),
                "note": input.new_batch.note,
            }),
            actor,
        )?;

        if input.archive_remainder {
            // Distinct from the dedicated archive: quantity is kept.
            let mut primary =
                Self::txn_read_batch(txn.as_ref(), org, &input.sources[0].batch_id)?;
            primary.status = BatchStatus::Archived;
            primary.archived_at = Some(now.clone());
            primary.updated_at = now;
            Self::txn_write_batch(txn.as_mut(), &primary)?;
        }

        txn.commit().map_err(super::store_err)?;

        info!(org, batch = %created.id, number = %batch_number, "transplant created batch");
        Ok(TransplantOutcome { id: created.id, batch_number })
    }

    /// Dump (loss/waste). Rejects over-draw with a conflict before any
    /// write; the read and decrement share one transaction, so two
    /// concurrent dumps cannot both pass the check.
    pub fn dump(
        &self,
        org: &str,
        batch_id: &str,
        input: DumpInput,
        actor: &Actor,
    ) -> Result<DumpOutcome, ServiceError> {
        if input.units == 0 {
            return Err(ServiceError::Validation("units must be > 0".into()));
        }
        if input.reason.is_empty() {
            return Err(ServiceError::Validation("reason must not be empty".into()));
        }

        let mut txn = self.kv.begin().map_err(super::store_err)?;
        let mut batch = Self::txn_read_batch(txn.as_ref(), org, batch_id)?;
        if batch.is_archived() {
            return Err(ServiceError::Conflict(format!(
                "batch {} is archived",
                batch_id
            )));
        }
        if input.units > batch.quantity {
            return Err(ServiceError::Conflict(format!(
                "dump of {} exceeds quantity {}",
                input.units, batch.quantity
            )));
        }

        batch.quantity -= input.units;
        batch.updated_at = now_rfc3339();
        let new_quantity = batch.quantity;

        let emptied = new_quantity == 0 && input.archive_if_empty;
        if emptied {
            batch.status = BatchStatus::Archived;
            batch.archived_at = Some(now_rfc3339());
        }
        Self::txn_write_batch(txn.as_mut(), &batch)?;
        Self::append_event(
            txn.as_mut(),
            org,
            batch_id,
            EventType::Dump,
            json!({
                "delta": -i64::from(input.units),
                "units": input.units,
                "reason": input.reason,
                "notes": input.notes,
                "newQuantity": new_quantity,
            }),
            actor,
        )?;
        if emptied {
            Self::append_event(
                txn.as_mut(),
                org,
                batch_id,
                EventType::Archive,
                json!({
                    "cause": "dump_to_zero",
                    "reason": input.reason,
                }),
                actor,
            )?;
        }
        txn.commit().map_err(super::store_err)?;

        info!(org, batch = batch_id, units = input.units, new_quantity, "batch dumped");
        Ok(DumpOutcome { new_quantity })
    }

    /// Archive a batch: force quantity to zero and mark it terminal.
    /// Archiving an already-zeroed batch appends no event.
    pub fn archive(
        &self,
        org: &str,
        batch_id: &str,
        reason: Option<String>,
        actor: &Actor,
    ) -> Result<Batch, ServiceError> {
        let mut txn = self.kv.begin().map_err(super::store_err)?;
        let mut batch = Self::txn_read_batch(txn.as_ref(), org, batch_id)?;

        // Keys are org-scoped, so a cross-tenant read should be
        // impossible; re-verify anyway before mutating.
        if batch.org_id != org {
            return Err(ServiceError::PermissionDenied(format!(
                "batch {} does not belong to this tenant",
                batch_id
            )));
        }

        if batch.is_archived() && batch.quantity == 0 {
            return Ok(batch);
        }

        let previous_quantity = batch.quantity;
        batch.quantity = 0;
        batch.status = BatchStatus::Archived;
        batch.archived_at = Some(now_rfc3339());
        batch.updated_at = now_rfc3339();
        Self::txn_write_batch(txn.as_mut(), &batch)?;

        if previous_quantity > 0 {
            Self::append_event(
                txn.as_mut(),
                org,
                batch_id,
                EventType::Archive,
                json!({
                    "delta": -i64::from(previous_quantity),
                    "previousQuantity": previous_quantity,
                    "reason": reason,
                }),
                actor,
            )?;
        }
        txn.commit().map_err(super::store_err)?;

        info!(org, batch = batch_id, previous_quantity, "batch archived");
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use potline_kv::RedbStore;

    use super::*;
    use crate::model::BatchEvent;

    fn temp_service() -> (tempfile::TempDir, BatchService) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RedbStore::open(&dir.path().join("test.redb")).unwrap());
        (dir, BatchService::new(store))
    }

    fn checkin(svc: &BatchService, org: &str, qty: u32, location: &str) -> Batch {
        svc.checkin(
            org,
            CheckinInput {
                phase: Phase::Propagation,
                quantity: qty,
                location_id: location.into(),
                supplier_id: None,
                variety: Some("Thymus vulgaris".into()),
                size: Some("P9".into()),
                note: None,
            },
            &Actor::default(),
        )
        .unwrap()
    }

    #[test]
    fn checkin_creates_batch_with_event() {
        let (_dir, svc) = temp_service();
        let b = checkin(&svc, "org1", 100, "L1");
        assert_eq!(b.quantity, 100);
        assert_eq!(b.initial_quantity, 100);
        assert!(number::is_sequential(&b.batch_number));

        let events = svc.history("org1", &b.id).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::Checkin);
        assert_eq!(events[0].delta(), 100);
    }

    #[test]
    fn full_move_relocates_without_quantity_change() {
        let (_dir, svc) = temp_service();
        let b = checkin(&svc, "org1", 100, "L1");
        let out = svc
            .move_batch(
                "org1",
                &b.id,
                MoveInput { destination: "L2".into(), quantity: None, spaced: None, note: None },
                &Actor::default(),
            )
            .unwrap();
        assert_eq!(out, MoveOutcome { moved_all: true, new_batch_id: None });

        let after = svc.get_batch("org1", &b.id).unwrap();
        assert_eq!(after.location_id, "L2");
        assert_eq!(after.quantity, 100);

        let events = svc.history("org1", &b.id).unwrap();
        assert_eq!(events.last().unwrap().event_type, EventType::Move);
        assert_eq!(events.last().unwrap().delta(), 0);
    }

    #[test]
    fn partial_move_splits_and_conserves_quantity() {
        let (_dir, svc) = temp_service();
        let a = checkin(&svc, "org1", 100, "L1");
        let out = svc
            .move_batch(
                "org1",
                &a.id,
                MoveInput { destination: "L2".into(), quantity: Some(40), spaced: None, note: None },
                &Actor::default(),
            )
            .unwrap();
        assert!(!out.moved_all);
        let child_id = out.new_batch_id.unwrap();

        let parent = svc.get_batch("org1", &a.id).unwrap();
        let child = svc.get_batch("org1", &child_id).unwrap();
        assert_eq!(parent.quantity, 60);
        assert_eq!(child.quantity, 40);
        assert_eq!(child.initial_quantity, 40);
        assert_eq!(child.location_id, "L2");
        assert_eq!(child.phase, parent.phase);
        assert_eq!(child.variety, parent.variety);
        assert_eq!(child.size, parent.size);
        assert_eq!(child.transplanted_from.as_deref(), Some(a.id.as_str()));
        assert_ne!(child.batch_number, parent.batch_number);

        // Conservation: parent_after + child == parent_before.
        assert_eq!(parent.quantity + child.quantity, 100);

        let parent_events = svc.history("org1", &a.id).unwrap();
        let split: Vec<&BatchEvent> = parent_events
            .iter()
            .filter(|e| e.event_type == EventType::MovePartial)
            .collect();
        assert_eq!(split.len(), 1);
        assert_eq!(split[0].delta(), -40);
    }

    #[test]
    fn full_move_with_spaced_sets_flag_and_records_change() {
        let (_dir, svc) = temp_service();
        let b = checkin(&svc, "org1", 100, "L1");
        svc.move_batch(
            "org1",
            &b.id,
            MoveInput {
                destination: "L2".into(),
                quantity: None,
                spaced: Some(true),
                note: None,
            },
            &Actor::default(),
        )
        .unwrap();

        let after = svc.get_batch("org1", &b.id).unwrap();
        assert_eq!(after.flags.get("spaced"), Some(&serde_json::json!(true)));

        let events = svc.history("org1", &b.id).unwrap();
        let kinds: Vec<EventType> = events.iter().map(|e| e.event_type).collect();
        assert_eq!(kinds, vec![EventType::Checkin, EventType::Move, EventType::FlagChange]);
        assert_eq!(
            events.last().unwrap().payload.get("key").and_then(|v| v.as_str()),
            Some("spaced")
        );
    }

    #[test]
    fn partial_move_with_spaced_flags_the_child_only() {
        let (_dir, svc) = temp_service();
        let a = checkin(&svc, "org1", 100, "L1");
        let out = svc
            .move_batch(
                "org1",
                &a.id,
                MoveInput {
                    destination: "L2".into(),
                    quantity: Some(40),
                    spaced: Some(true),
                    note: None,
                },
                &Actor::default(),
            )
            .unwrap();
        let child_id = out.new_batch_id.unwrap();

        let parent = svc.get_batch("org1", &a.id).unwrap();
        let child = svc.get_batch("org1", &child_id).unwrap();
        assert!(parent.flags.is_empty());
        assert_eq!(child.flags.get("spaced"), Some(&serde_json::json!(true)));

        let child_events = svc.history("org1", &child_id).unwrap();
        assert_eq!(child_events.last().unwrap().event_type, EventType::FlagChange);
    }

    #[test]
    fn dump_input_accepts_snake_case_archive_field() {
        let input: DumpInput = serde_json::from_str(
            r#"{"units": 5, "reason": "pest", "archive_if_empty": false}"#,
        )
        .unwrap();
        assert!(!input.archive_if_empty);

        let input: DumpInput =
            serde_json::from_str(r#"{"units": 5, "reason": "pest", "archiveIfEmpty": false}"#)
                .unwrap();
        assert!(!input.archive_if_empty);
    }

    #[test]
    fn move_rejects_zero_and_overdraw() {
        let (_dir, svc) = temp_service();
        let b = checkin(&svc, "org1", 10, "L1");

        let err = svc
            .move_batch(
                "org1",
                &b.id,
                MoveInput { destination: "L2".into(), quantity: Some(0), spaced: None, note: None },
                &Actor::default(),
            )
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));

        let err = svc
            .move_batch(
                "org1",
                &b.id,
                MoveInput { destination: "L2".into(), quantity: Some(11), spaced: None, note: None },
                &Actor::default(),
            )
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));

        // Nothing changed, no events beyond the checkin.
        assert_eq!(svc.get_batch("org1", &b.id).unwrap().quantity, 10);
        assert_eq!(svc.history("org1", &b.id).unwrap().len(), 1);
    }

    #[test]
    fn dump_decrements_and_rejects_overdraw() {
        let (_dir, svc) = temp_service();
        let b = checkin(&svc, "org1", 60, "L1");

        let err = svc
            .dump(
                "org1",
                &b.id,
                DumpInput {
                    units: 80,
                    reason: "pest".into(),
                    archive_if_empty: true,
                    notes: None,
                },
                &Actor::default(),
            )
            .unwrap_err();
        assert!(matches!(err, ServiceError::Conflict(_)));
        assert_eq!(svc.get_batch("org1", &b.id).unwrap().quantity, 60);

        let out = svc
            .dump(
                "org1",
                &b.id,
                DumpInput {
                    units: 20,
                    reason: "pest".into(),
                    archive_if_empty: true,
                    notes: None,
                },
                &Actor::default(),
            )
            .unwrap();
        assert_eq!(out.new_quantity, 40);
    }

    #[test]
    fn dump_to_zero_archives_with_both_events() {
        let (_dir, svc) = temp_service();
        let c = checkin(&svc, "org1", 60, "L1");
        let out = svc
            .dump(
                "org1",
                &c.id,
                DumpInput {
                    units: 60,
                    reason: "pest".into(),
                    archive_if_empty: true,
                    notes: None,
                },
                &Actor::default(),
            )
            .unwrap();
        assert_eq!(out.new_quantity, 0);

        let after = svc.get_batch("org1", &c.id).unwrap();
        assert_eq!(after.status, BatchStatus::Archived);
        assert!(after.archived_at.is_some());

        let events = svc.history("org1", &c.id).unwrap();
        let kinds: Vec<EventType> = events.iter().map(|e| e.event_type).collect();
        assert_eq!(kinds, vec![EventType::Checkin, EventType::Dump, EventType::Archive]);
    }

    #[test]
    fn dump_to_zero_without_archive_flag_keeps_status() {
        let (_dir, svc) = temp_service();
        let b = checkin(&svc, "org1", 5, "L1");
        svc.dump(
            "org1",
            &b.id,
            DumpInput {
                units: 5,
                reason: "shrinkage".into(),
                archive_if_empty: false,
                notes: None,
            },
            &Actor::default(),
        )
        .unwrap();
        let after = svc.get_batch("org1", &b.id).unwrap();
        assert_eq!(after.quantity, 0);
        assert_eq!(after.status, BatchStatus::Growing);
    }

    #[test]
    fn archived_batch_rejects_move_and_dump() {
        let (_dir, svc) = temp_service();
        let b = checkin(&svc, "org1", 10, "L1");
        svc.archive("org1", &b.id, Some("season end".into()), &Actor::default())
            .unwrap();

        let err = svc
            .move_batch(
                "org1",
                &b.id,
                MoveInput { destination: "L2".into(), quantity: None, spaced: None, note: None },
                &Actor::default(),
            )
            .unwrap_err();
        assert!(matches!(err, ServiceError::Conflict(_)));

        let err = svc
            .dump(
                "org1",
                &b.id,
                DumpInput {
                    units: 1,
                    reason: "x".into(),
                    archive_if_empty: true,
                    notes: None,
                },
                &Actor::default(),
            )
            .unwrap_err();
        assert!(matches!(err, ServiceError::Conflict(_)));
    }

    #[test]
    fn archive_zeroes_quantity_and_is_idempotent() {
        let (_dir, svc) = temp_service();
        let b = checkin(&svc, "org1", 30, "L1");

        let archived = svc
            .archive("org1", &b.id, Some("frost".into()), &Actor::default())
            .unwrap();
        assert_eq!(archived.quantity, 0);
        assert_eq!(archived.status, BatchStatus::Archived);

        let events_after_first = svc.history("org1", &b.id).unwrap().len();

        // Second archive is a no-op: no extra event.
        svc.archive("org1", &b.id, Some("frost".into()), &Actor::default())
            .unwrap();
        assert_eq!(svc.history("org1", &b.id).unwrap().len(), events_after_first);
    }

    #[test]
    fn archive_of_zero_quantity_batch_appends_no_event() {
        let (_dir, svc) = temp_service();
        let b = checkin(&svc, "org1", 5, "L1");
        svc.dump(
            "org1",
            &b.id,
            DumpInput {
                units: 5,
                reason: "shrinkage".into(),
                archive_if_empty: false,
                notes: None,
            },
            &Actor::default(),
        )
        .unwrap();

        let before = svc.history("org1", &b.id).unwrap().len();
        svc.archive("org1", &b.id, None, &Actor::default()).unwrap();
        // Status flipped, but nothing changed quantity-wise: no event.
        assert_eq!(svc.history("org1", &b.id).unwrap().len(), before);
        assert!(svc.get_batch("org1", &b.id).unwrap().is_archived());
    }

    #[test]
    fn transplant_consumes_two_sources_and_creates_batch() {
        let (_dir, svc) = temp_service();
        let s1 = checkin(&svc, "org1", 100, "L1");
        let s2 = checkin(&svc, "org1", 50, "L1");

        let out = svc
            .transplant(
                "org1",
                TransplantInput {
                    sources: vec![
                        TransplantSource { batch_id: s1.id.clone(), units_used: 60 },
                        TransplantSource { batch_id: s2.id.clone(), units_used: 20 },
                    ],
                    new_batch: CheckinInput {
                        phase: Phase::Potting,
                        quantity: 75,
                        location_id: "L3".into(),
                        supplier_id: None,
                        variety: Some("Thymus vulgaris".into()),
                        size: Some("C1".into()),
                        note: None,
                    },
                    archive_remainder: false,
                },
                &Actor::default(),
            )
            .unwrap();

        assert!(out.batch_number.starts_with("3-"));
        let created = svc.get_batch("org1", &out.id).unwrap();
        assert_eq!(created.quantity, 75);
        assert_eq!(created.initial_quantity, 75);
        assert_eq!(created.transplanted_from.as_deref(), Some(s1.id.as_str()));

        assert_eq!(svc.get_batch("org1", &s1.id).unwrap().quantity, 40);
        assert_eq!(svc.get_batch("org1", &s2.id).unwrap().quantity, 30);

        // Both sources carry a TRANSPLANT_USED event naming the new batch.
        for sid in [&s1.id, &s2.id] {
            let used: Vec<BatchEvent> = svc
                .history("org1", sid)
                .unwrap()
                .into_iter()
                .filter(|e| e.event_type == EventType::TransplantUsed)
                .collect();
            assert_eq!(used.len(), 1);
            assert_eq!(
                used[0].payload.get("newBatchId").and_then(|v| v.as_str()),
                Some(out.id.as_str())
            );
        }
    }

    #[test]
    fn transplant_clamps_overconsumption_at_zero() {
        let (_dir, svc) = temp_service();
        let s = checkin(&svc, "org1", 10, "L1");
        svc.transplant(
            "org1",
            TransplantInput {
                sources: vec![TransplantSource { batch_id: s.id.clone(), units_used: 25 }],
                new_batch: CheckinInput {
                    phase: Phase::Plugs,
                    quantity: 8,
                    location_id: "L2".into(),
                    supplier_id: None,
                    variety: None,
                    size: None,
                    note: None,
                },
                archive_remainder: false,
            },
            &Actor::default(),
        )
        .unwrap();

        let src = svc.get_batch("org1", &s.id).unwrap();
        assert_eq!(src.quantity, 0);

        let used = svc
            .history("org1", &s.id)
            .unwrap()
            .into_iter()
            .find(|e| e.event_type == EventType::TransplantUsed)
            .unwrap();
        assert_eq!(used.payload.get("unitsRequested").and_then(|v| v.as_u64()), Some(25));
        assert_eq!(used.payload.get("unitsApplied").and_then(|v| v.as_u64()), Some(10));
        // Delta records the applied change, so replay still balances.
        assert_eq!(used.delta(), -10);
    }

    #[test]
    fn transplant_archive_remainder_keeps_quantity() {
        let (_dir, svc) = temp_service();
        let s = checkin(&svc, "org1", 100, "L1");
        svc.transplant(
            "org1",
            TransplantInput {
                sources: vec![TransplantSource { batch_id: s.id.clone(), units_used: 30 }],
                new_batch: CheckinInput {
                    phase: Phase::Potting,
                    quantity: 30,
                    location_id: "L2".into(),
                    supplier_id: None,
                    variety: None,
                    size: None,
                    note: None,
                },
                archive_remainder: true,
            },
            &Actor::default(),
        )
        .unwrap();

        let src = svc.get_batch("org1", &s.id).unwrap();
        assert_eq!(src.status, BatchStatus::Archived);
        // Unlike the dedicated archive, the remainder is kept.
        assert_eq!(src.quantity, 70);
    }

    #[test]
    fn transplant_rejects_bad_shapes() {
        let (_dir, svc) = temp_service();
        let s = checkin(&svc, "org1", 10, "L1");

        let base_new = CheckinInput {
            phase: Phase::Plugs,
            quantity: 5,
            location_id: "L2".into(),
            supplier_id: None,
            variety: None,
            size: None,
            note: None,
        };

        let err = svc
            .transplant(
                "org1",
                TransplantInput {
                    sources: vec![],
                    new_batch: base_new.clone(),
                    archive_remainder: false,
                },
                &Actor::default(),
            )
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));

        let err = svc
            .transplant(
                "org1",
                TransplantInput {
                    sources: vec![
                        TransplantSource { batch_id: s.id.clone(), units_used: 1 },
                        TransplantSource { batch_id: s.id.clone(), units_used: 1 },
                        TransplantSource { batch_id: s.id.clone(), units_used: 1 },
                    ],
                    new_batch: base_new.clone(),
                    archive_remainder: false,
                },
                &Actor::default(),
            )
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));

        let err = svc
            .transplant(
                "org1",
                TransplantInput {
                    sources: vec![TransplantSource { batch_id: "missing".into(), units_used: 1 }],
                    new_batch: base_new,
                    archive_remainder: false,
                },
                &Actor::default(),
            )
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
        // Failed transplant left no new batches behind.
        assert_eq!(
            svc.list_batches("org1", &Default::default(), &Default::default())
                .unwrap()
                .total,
            1
        );
    }

    #[test]
    fn tenant_isolation_on_reads_and_mutations() {
        let (_dir, svc) = temp_service();
        let b = checkin(&svc, "org1", 10, "L1");

        assert!(matches!(
            svc.get_batch("org2", &b.id).unwrap_err(),
            ServiceError::NotFound(_)
        ));
        assert!(matches!(
            svc.dump(
                "org2",
                &b.id,
                DumpInput {
                    units: 1,
                    reason: "x".into(),
                    archive_if_empty: true,
                    notes: None
                },
                &Actor::default()
            )
            .unwrap_err(),
            ServiceError::NotFound(_)
        ));
        assert_eq!(
            svc.list_batches("org2", &Default::default(), &Default::default())
                .unwrap()
                .total,
            0
        );
    }

    #[test]
    fn reconcile_balances_after_mixed_history() {
        let (_dir, svc) = temp_service();
        let a = checkin(&svc, "org1", 100, "L1");
        let out = svc
            .move_batch(
                "org1",
                &a.id,
                MoveInput { destination: "L2".into(), quantity: Some(40), spaced: None, note: None },
                &Actor::default(),
            )
            .unwrap();
        let child_id = out.new_batch_id.unwrap();
        svc.dump(
            "org1",
            &a.id,
            DumpInput {
                units: 15,
                reason: "pest".into(),
                archive_if_empty: true,
                notes: None,
            },
            &Actor::default(),
        )
        .unwrap();

        for id in [&a.id, &child_id] {
            let rec = svc.reconcile("org1", id).unwrap();
            assert!(rec.consistent, "batch {} drifted: {:?}", id, rec);
        }

        svc.archive("org1", &a.id, None, &Actor::default()).unwrap();
        let rec = svc.reconcile("org1", &a.id).unwrap();
        assert_eq!(rec.current, 0);
        assert!(rec.consistent);
    }

    #[test]
    fn concurrent_checkins_get_distinct_contiguous_numbers() {
        let (_dir, svc) = temp_service();
        let svc = Arc::new(svc);

        let mut handles = Vec::new();
        for _ in 0..10 {
            let svc = Arc::clone(&svc);
            handles.push(std::thread::spawn(move || {
                let mut numbers = Vec::new();
                for _ in 0..10 {
                    let b = svc
                        .checkin(
                            "org1",
                            CheckinInput {
                                phase: Phase::Propagation,
                                quantity: 1,
                                location_id: "L1".into(),
                                supplier_id: None,
                                variety: None,
                                size: None,
                                note: None,
                            },
                            &Actor::default(),
                        )
                        .unwrap();
                    numbers.push(b.batch_number);
                }
                numbers
            }));
        }

        let mut all: Vec<String> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 100, "batch numbers must be distinct");

        // Contiguous from 1: sequences are exactly 1..=100.
        let mut seqs: Vec<u64> = all
            .iter()
            .map(|n| n.rsplit('-').next().unwrap().parse().unwrap())
            .collect();
        seqs.sort_unstable();
        assert_eq!(seqs, (1..=100).collect::<Vec<u64>>());
    }
}
