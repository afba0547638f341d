use axum::{
    Json, Router,
    extract::{Path, Query, State},
    response::Response,
    routing::get,
};
use serde::Deserialize;

use potline_core::{ListParams, ListResult, RequestId, ServiceError, Tenant};

use super::{AppState, actor, reply, to_body};
use crate::model::{Batch, BatchEvent};
use crate::service::BatchFilters;
use crate::service::audit::Reconciliation;
use crate::service::ledger::CheckinInput;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/batches", get(list_batches).post(create_batch))
        .route("/batches/{id}", get(get_batch))
        .route("/batches/{id}/events", get(batch_events))
        .route("/batches/{id}/reconcile", get(reconcile_batch))
}

// Flat on purpose: the query deserializer cannot flatten nested
// structs with numeric fields.
#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct BatchQuery {
    limit: Option<usize>,
    offset: Option<usize>,
    status: Option<String>,
    phase: Option<String>,
    location_id: Option<String>,
}

impl BatchQuery {
    fn split(self) -> (ListParams, BatchFilters) {
        let defaults = ListParams::default();
        (
            ListParams {
                limit: self.limit.unwrap_or(defaults.limit),
                offset: self.offset.unwrap_or(defaults.offset),
            },
            BatchFilters {
                status: self.status,
                phase: self.phase,
                location_id: self.location_id,
            },
        )
    }
}

async fn create_batch(
    State(svc): State<AppState>,
    tenant: Tenant,
    request_id: RequestId,
    Json(body): Json<CheckinInput>,
) -> Result<Response, ServiceError> {
    let act = actor(&tenant, &request_id);
    let org = tenant.org_id;
    let (status, value) = svc
        .execute_idempotent(&org, "checkin", request_id.0.as_deref(), || {
            let batch = svc.checkin(&org, body, &act)?;
            Ok((201, to_body(&batch)?))
        })
        .await?;
    Ok(reply(status, value))
}

async fn get_batch(
    State(svc): State<AppState>,
    tenant: Tenant,
    Path(id): Path<String>,
) -> Result<Json<Batch>, ServiceError> {
    Ok(Json(svc.get_batch(&tenant.org_id, &id)?))
}

async fn list_batches(
    State(svc): State<AppState>,
    tenant: Tenant,
    Query(q): Query<BatchQuery>,
) -> Result<Json<ListResult<Batch>>, ServiceError> {
    let (params, filters) = q.split();
    Ok(Json(svc.list_batches(&tenant.org_id, &params, &filters)?))
}

async fn batch_events(
    State(svc): State<AppState>,
    tenant: Tenant,
    Path(id): Path<String>,
) -> Result<Json<ListResult<BatchEvent>>, ServiceError> {
    let items = svc.history(&tenant.org_id, &id)?;
    let total = items.len();
    Ok(Json(ListResult { items, total }))
}

async fn reconcile_batch(
    State(svc): State<AppState>,
    tenant: Tenant,
    Path(id): Path<String>,
) -> Result<Json<Reconciliation>, ServiceError> {
    Ok(Json(svc.reconcile(&tenant.org_id, &id)?))
}
