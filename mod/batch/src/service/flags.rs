//! Batch flags — named boolean/enum/number attributes with their own
//! audited history. Independent of quantity: no conservation rules, no
//! delta on the FLAG_CHANGE event. Flags stay writable on archived
//! batches (a dead batch can still be marked `disposal_confirmed`).

use std::collections::BTreeMap;

use potline_core::{ServiceError, now_rfc3339};
use serde_json::json;
use tracing::info;

use super::{Actor, BatchService, store_err};
use crate::model::{BatchEvent, EventType};

impl BatchService {
    pub fn get_flags(
        &self,
        org: &str,
        batch_id: &str,
    ) -> Result<BTreeMap<String, serde_json::Value>, ServiceError> {
        Ok(self.get_batch(org, batch_id)?.flags)
    }

    /// Set (or, with a null value, clear) one flag and record the
    /// change. The batch update and the FLAG_CHANGE event share one
    /// write transaction.
    pub fn set_flag(
        &self,
        org: &str,
        batch_id: &str,
        key: &str,
        value: serde_json::Value,
        reason: Option<String>,
        actor: &Actor,
    ) -> Result<BTreeMap<String, serde_json::Value>, ServiceError> {
        if key.is_empty()
            || !key
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
        {
            return Err(ServiceError::Validation(format!(
                "invalid flag key '{}'",
                key
            )));
        }
        if value.is_object() || value.is_array() {
            return Err(ServiceError::Validation(
                "flag value must be a boolean, number, or string".into(),
            ));
        }

        let mut txn = self.kv.begin().map_err(store_err)?;
        let mut batch = Self::txn_read_batch(txn.as_ref(), org, batch_id)?;

        let old = if value.is_null() {
            batch.flags.remove(key)
        } else {
            batch.flags.insert(key.to_string(), value.clone())
        };
        batch.updated_at = now_rfc3339();
        Self::txn_write_batch(txn.as_mut(), &batch)?;
        Self::append_event(
            txn.as_mut(),
            org,
            batch_id,
            EventType::FlagChange,
            json!({
                "key": key,
                "old": old,
                "new": value,
                "reason": reason,
            }),
            actor,
        )?;
        txn.commit().map_err(store_err)?;

        info!(org, batch = batch_id, key, "flag changed");
        Ok(batch.flags)
    }

    /// Flag-change history for one batch, oldest first.
    pub fn flag_history(
        &self,
        org: &str,
        batch_id: &str,
    ) -> Result<Vec<BatchEvent>, ServiceError> {
        Ok(self
            .history(org, batch_id)?
            .into_iter()
            .filter(|e| e.event_type == EventType::FlagChange)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use potline_kv::RedbStore;

    use super::*;
    use crate::model::Phase;
    use crate::service::ledger::CheckinInput;

    fn temp_service() -> (tempfile::TempDir, BatchService) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RedbStore::open(&dir.path().join("test.redb")).unwrap());
        (dir, BatchService::new(store))
    }

    fn checkin(svc: &BatchService) -> String {
        svc.checkin(
            "org1",
            CheckinInput {
                phase: Phase::Plugs,
                quantity: 10,
                location_id: "L1".into(),
                supplier_id: None,
                variety: None,
                size: None,
                note: None,
            },
            &Actor::default(),
        )
        .unwrap()
        .id
    }

    #[test]
    fn set_and_clear_flag_with_history() {
        let (_dir, svc) = temp_service();
        let id = checkin(&svc);

        let flags = svc
            .set_flag("org1", &id, "spaced", json!(true), None, &Actor::default())
            .unwrap();
        assert_eq!(flags.get("spaced"), Some(&json!(true)));

        let flags = svc
            .set_flag(
                "org1",
                &id,
                "spaced",
                json!(false),
                Some("benches consolidated".into()),
                &Actor::default(),
            )
            .unwrap();
        assert_eq!(flags.get("spaced"), Some(&json!(false)));

        let flags = svc
            .set_flag("org1", &id, "spaced", json!(null), None, &Actor::default())
            .unwrap();
        assert!(flags.is_empty());

        let history = svc.flag_history("org1", &id).unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[1].payload.get("old"), Some(&json!(true)));
        assert_eq!(history[1].payload.get("new"), Some(&json!(false)));
        // Flag changes never carry a quantity delta.
        assert!(history.iter().all(|e| e.delta() == 0));
    }

    #[test]
    fn flag_changes_do_not_affect_reconciliation() {
        let (_dir, svc) = temp_service();
        let id = checkin(&svc);
        svc.set_flag("org1", &id, "grade", json!("A"), None, &Actor::default())
            .unwrap();
        let rec = svc.reconcile("org1", &id).unwrap();
        assert!(rec.consistent);
        assert_eq!(rec.current, 10);
    }

    #[test]
    fn rejects_bad_keys_and_compound_values() {
        let (_dir, svc) = temp_service();
        let id = checkin(&svc);

        for bad_key in ["", "has space", "has:colon"] {
            let err = svc
                .set_flag("org1", &id, bad_key, json!(true), None, &Actor::default())
                .unwrap_err();
            assert!(matches!(err, ServiceError::Validation(_)), "key {:?}", bad_key);
        }

        let err = svc
            .set_flag("org1", &id, "ok", json!({"nested": 1}), None, &Actor::default())
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
    }

    #[test]
    fn flags_on_unknown_batch_are_not_found() {
        let (_dir, svc) = temp_service();
        assert!(matches!(
            svc.get_flags("org1", "missing").unwrap_err(),
            ServiceError::NotFound(_)
        ));
    }
}
