//! Idempotency guard for mutating endpoints.
//!
//! A caller-supplied token (`X-Request-Id`) dedupes the whole ledger
//! call. The first caller atomically claims the key with a Pending
//! record; everyone else waits (bounded) for the winner's stored result
//! and returns it verbatim. The key is scoped by tenant and operation,
//! so a client reusing a raw header value cannot collide across tenants
//! or routes.
//!
//! The mutation executes at most once per live record: the claim is a
//! check-and-insert inside a write transaction, and a failed mutation
//! releases the claim so a retry can execute again. Records expire
//! after a few minutes — long enough for a retry storm, short enough to
//! bound storage.

use potline_core::{ServiceError, now_rfc3339};
use tracing::{debug, warn};

use super::{BatchService, codec_err, idem_key, store_err};
use crate::model::{IdempotencyRecord, IdempotencyState};

/// Record lifetime. Minutes, not hours.
const TTL_SECS: i64 = 300;

/// Polling slice while waiting on another in-flight execution.
const WAIT_SLICE_MS: u64 = 50;

/// Upper bound on the total wait for a winner's result.
const MAX_WAIT_MS: u64 = 2_000;

enum Claim {
    /// We hold the key; run the operation.
    Acquired,
    /// Someone already finished; here is their result.
    Replay(u16, serde_json::Value),
    /// Someone is still running.
    InFlight,
}

impl BatchService {
    /// Run `op` at most once for the given idempotency token.
    ///
    /// Without a token the operation runs directly. With one, the
    /// result of the first successful execution is returned for every
    /// call presenting the same token until the record expires.
    pub async fn execute_idempotent<F>(
        &self,
        org: &str,
        scope: &str,
        token: Option<&str>,
        op: F,
    ) -> Result<(u16, serde_json::Value), ServiceError>
    where
        F: FnOnce() -> Result<(u16, serde_json::Value), ServiceError>,
    {
        let Some(token) = token else {
            return op();
        };
        let key = idem_key(org, scope, token);

        // First attempt, plus one retry if the winner vanished
        // without storing a result.
        for attempt in 0..2 {
            match self.claim(&key)? {
                Claim::Replay(status, body) => {
                    debug!(key = %key, "idempotent replay");
                    return Ok((status, body));
                }
                Claim::Acquired => {
                    return match op() {
                        Ok((status, body)) => {
                            self.store_result(&key, status, &body)?;
                            Ok((status, body))
                        }
                        Err(e) => {
                            // The mutation rolled back; release the key
                            // so a retry can execute.
                            self.kv.delete(&key).map_err(store_err)?;
                            Err(e)
                        }
                    };
                }
                Claim::InFlight => {
                    if let Some((status, body)) = self.await_winner(&key).await? {
                        return Ok((status, body));
                    }
                    warn!(key = %key, attempt, "idempotency winner produced no result");
                }
            }
        }

        Err(ServiceError::Conflict(
            "a request with this idempotency key is still in flight".into(),
        ))
    }

    /// Atomically claim the key, or report the existing record.
    fn claim(&self, key: &str) -> Result<Claim, ServiceError> {
        let mut txn = self.kv.begin().map_err(store_err)?;
        let now = chrono::Utc::now().timestamp();

        if let Some(raw) = txn.get(key).map_err(store_err)? {
            let rec: IdempotencyRecord = serde_json::from_slice(&raw).map_err(codec_err)?;
            if !rec.is_expired(now) {
                return match rec.state {
                    IdempotencyState::Done => Ok(Claim::Replay(rec.status, rec.body)),
                    IdempotencyState::Pending => Ok(Claim::InFlight),
                };
            }
            // Expired: fall through and reclaim.
        }

        let rec = IdempotencyRecord {
            key: key.to_string(),
            state: IdempotencyState::Pending,
            status: 0,
            body: serde_json::Value::Null,
            created_at: now_rfc3339(),
            expires_at: now + TTL_SECS,
        };
        let data = serde_json::to_vec(&rec).map_err(codec_err)?;
        txn.set(key, &data).map_err(store_err)?;
        txn.commit().map_err(store_err)?;
        Ok(Claim::Acquired)
    }

    /// Store the winner's result snapshot.
    fn store_result(
        &self,
        key: &str,
        status: u16,
        body: &serde_json::Value,
    ) -> Result<(), ServiceError> {
        let mut txn = self.kv.begin().map_err(store_err)?;
        let now = chrono::Utc::now().timestamp();
        let rec = IdempotencyRecord {
            key: key.to_string(),
            state: IdempotencyState::Done,
            status,
            body: body.clone(),
            created_at: now_rfc3339(),
            expires_at: now + TTL_SECS,
        };
        let data = serde_json::to_vec(&rec).map_err(codec_err)?;
        txn.set(key, &data).map_err(store_err)?;
        txn.commit().map_err(store_err)
    }

    /// Delete all expired idempotency records for every tenant. The
    /// claim path only reclaims a key when the same token returns, so
    /// the server runs this periodically to keep unique tokens from
    /// accumulating.
    pub fn sweep_expired_idempotency(&self) -> Result<usize, ServiceError> {
        let now = chrono::Utc::now().timestamp();
        let entries = self.kv.scan("idem:").map_err(store_err)?;
        if entries.is_empty() {
            return Ok(0);
        }

        let mut txn = self.kv.begin().map_err(store_err)?;
        let mut removed = 0;
        for (key, raw) in entries {
            let rec: IdempotencyRecord = serde_json::from_slice(&raw).map_err(codec_err)?;
            if rec.is_expired(now) {
                txn.delete(&key).map_err(store_err)?;
                removed += 1;
            }
        }
        txn.commit().map_err(store_err)?;

        if removed > 0 {
            debug!(removed, "swept expired idempotency records");
        }
        Ok(removed)
    }

    /// Wait (bounded) for the in-flight winner to store its result.
    /// None means the winner released or expired without one.
    async fn await_winner(
        &self,
        key: &str,
    ) -> Result<Option<(u16, serde_json::Value)>, ServiceError> {
        let mut waited = 0u64;
        while waited < MAX_WAIT_MS {
            tokio::time::sleep(std::time::Duration::from_millis(WAIT_SLICE_MS)).await;
            waited += WAIT_SLICE_MS;

            let Some(raw) = self.kv.get(key).map_err(store_err)? else {
                return Ok(None);
            };
            let rec: IdempotencyRecord = serde_json::from_slice(&raw).map_err(codec_err)?;
            if rec.is_expired(chrono::Utc::now().timestamp()) {
                return Ok(None);
            }
            if rec.state == IdempotencyState::Done {
                return Ok(Some((rec.status, rec.body)));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use potline_kv::RedbStore;
    use serde_json::json;

    use super::*;

    fn temp_service() -> (tempfile::TempDir, BatchService) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RedbStore::open(&dir.path().join("test.redb")).unwrap());
        (dir, BatchService::new(store))
    }

    #[tokio::test]
    async fn replay_returns_identical_result_and_runs_once() {
        let (_dir, svc) = temp_service();
        let calls = AtomicU32::new(0);

        let first = svc
            .execute_idempotent("org1", "move:b1", Some("req-1"), || {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok((201, json!({"movedAll": true, "newBatchId": null})))
            })
            .await
            .unwrap();
        let second = svc
            .execute_idempotent("org1", "move:b1", Some("req-1"), || {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok((201, json!({"movedAll": true, "newBatchId": null})))
            })
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(first.0, 201);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_token_executes_every_time() {
        let (_dir, svc) = temp_service();
        let calls = AtomicU32::new(0);
        for _ in 0..3 {
            svc.execute_idempotent("org1", "dump:b1", None, || {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok((200, json!({"newQuantity": 1})))
            })
            .await
            .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn failed_operation_releases_the_key() {
        let (_dir, svc) = temp_service();

        let err = svc
            .execute_idempotent("org1", "dump:b1", Some("req-2"), || {
                Err::<(u16, serde_json::Value), _>(ServiceError::Conflict("over-draw".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Conflict(_)));

        // A retry with the same key executes again.
        let (status, _) = svc
            .execute_idempotent("org1", "dump:b1", Some("req-2"), || {
                Ok((200, json!({"newQuantity": 0})))
            })
            .await
            .unwrap();
        assert_eq!(status, 200);
    }

    #[tokio::test]
    async fn same_token_different_scope_does_not_collide() {
        let (_dir, svc) = temp_service();
        let (s1, _) = svc
            .execute_idempotent("org1", "move:b1", Some("tok"), || Ok((201, json!(1))))
            .await
            .unwrap();
        let (s2, b2) = svc
            .execute_idempotent("org1", "dump:b1", Some("tok"), || Ok((200, json!(2))))
            .await
            .unwrap();
        assert_eq!(s1, 201);
        assert_eq!(s2, 200);
        assert_eq!(b2, json!(2));
    }

    #[tokio::test]
    async fn same_token_different_tenant_does_not_collide() {
        let (_dir, svc) = temp_service();
        let (_, b1) = svc
            .execute_idempotent("org1", "move:b1", Some("tok"), || Ok((201, json!("one"))))
            .await
            .unwrap();
        let (_, b2) = svc
            .execute_idempotent("org2", "move:b1", Some("tok"), || Ok((201, json!("two"))))
            .await
            .unwrap();
        assert_eq!(b1, json!("one"));
        assert_eq!(b2, json!("two"));
    }

    #[tokio::test]
    async fn waiter_returns_winner_result_without_executing() {
        let (_dir, svc) = temp_service();
        let svc = Arc::new(svc);
        let key = idem_key("org1", "move:b1", "shared");

        // A live Pending record: someone else is mid-flight.
        let rec = IdempotencyRecord {
            key: key.clone(),
            state: IdempotencyState::Pending,
            status: 0,
            body: serde_json::Value::Null,
            created_at: now_rfc3339(),
            expires_at: chrono::Utc::now().timestamp() + TTL_SECS,
        };
        svc.kv.set(&key, &serde_json::to_vec(&rec).unwrap()).unwrap();

        let winner = Arc::clone(&svc);
        let writer = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(150)).await;
            winner.store_result(&key, 201, &json!("winner")).unwrap();
        });

        let calls = AtomicU32::new(0);
        let (status, body) = svc
            .execute_idempotent("org1", "move:b1", Some("shared"), || {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok((500, json!("loser")))
            })
            .await
            .unwrap();
        writer.await.unwrap();

        assert_eq!(status, 201);
        assert_eq!(body, json!("winner"));
        assert_eq!(calls.load(Ordering::SeqCst), 0, "loser must not execute");
    }

    #[tokio::test]
    async fn sweep_removes_only_expired_records() {
        let (_dir, svc) = temp_service();
        let now = chrono::Utc::now().timestamp();

        for (token, expires_at) in [("stale-1", now - 10), ("stale-2", now - 1), ("live", now + 60)] {
            let key = idem_key("org1", "move:b1", token);
            let rec = IdempotencyRecord {
                key: key.clone(),
                state: IdempotencyState::Done,
                status: 200,
                body: json!(token),
                created_at: now_rfc3339(),
                expires_at,
            };
            svc.kv.set(&key, &serde_json::to_vec(&rec).unwrap()).unwrap();
        }

        assert_eq!(svc.sweep_expired_idempotency().unwrap(), 2);
        assert!(svc.kv.get(&idem_key("org1", "move:b1", "stale-1")).unwrap().is_none());
        assert!(svc.kv.get(&idem_key("org1", "move:b1", "live")).unwrap().is_some());

        // Nothing left to collect.
        assert_eq!(svc.sweep_expired_idempotency().unwrap(), 0);
    }

    #[tokio::test]
    async fn expired_record_is_reclaimed() {
        let (_dir, svc) = temp_service();
        // Plant an already-expired Done record.
        let key = idem_key("org1", "move:b1", "old");
        let rec = IdempotencyRecord {
            key: key.clone(),
            state: IdempotencyState::Done,
            status: 201,
            body: json!("stale"),
            created_at: now_rfc3339(),
            expires_at: chrono::Utc::now().timestamp() - 1,
        };
        svc.kv.set(&key, &serde_json::to_vec(&rec).unwrap()).unwrap();

        let (_, body) = svc
            .execute_idempotent("org1", "move:b1", Some("old"), || Ok((201, json!("fresh"))))
            .await
            .unwrap();
        assert_eq!(body, json!("fresh"));
    }
}
