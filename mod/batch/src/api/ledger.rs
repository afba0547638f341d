use axum::{
    Json, Router,
    extract::{Path, State},
    response::Response,
    routing::post,
};
use serde::Deserialize;

use potline_core::{RequestId, ServiceError, Tenant};

use super::{AppState, actor, reply, to_body};
use crate::service::ledger::{DumpInput, MoveInput, TransplantInput};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/batches/{id}/move", post(move_batch))
        .route("/batches/{id}/dump", post(dump_batch))
        .route("/batches/{id}/archive", post(archive_batch))
        .route("/transplant", post(transplant))
}

async fn move_batch(
    State(svc): State<AppState>,
    tenant: Tenant,
    request_id: RequestId,
    Path(id): Path<String>,
    Json(body): Json<MoveInput>,
) -> Result<Response, ServiceError> {
    let act = actor(&tenant, &request_id);
    let org = tenant.org_id;
    let scope = format!("move:{}", id);
    let (status, value) = svc
        .execute_idempotent(&org, &scope, request_id.0.as_deref(), || {
            let out = svc.move_batch(&org, &id, body, &act)?;
            Ok((201, to_body(&out)?))
        })
        .await?;
    Ok(reply(status, value))
}

async fn dump_batch(
    State(svc): State<AppState>,
    tenant: Tenant,
    request_id: RequestId,
    Path(id): Path<String>,
    Json(body): Json<DumpInput>,
) -> Result<Response, ServiceError> {
    let act = actor(&tenant, &request_id);
    let org = tenant.org_id;
    let scope = format!("dump:{}", id);
    let (status, value) = svc
        .execute_idempotent(&org, &scope, request_id.0.as_deref(), || {
            let out = svc.dump(&org, &id, body, &act)?;
            Ok((200, to_body(&out)?))
        })
        .await?;
    Ok(reply(status, value))
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ArchiveBody {
    #[serde(default)]
    reason: Option<String>,
}

async fn archive_batch(
    State(svc): State<AppState>,
    tenant: Tenant,
    request_id: RequestId,
    Path(id): Path<String>,
    body: Option<Json<ArchiveBody>>,
) -> Result<Response, ServiceError> {
    let act = actor(&tenant, &request_id);
    let org = tenant.org_id;
    let reason = body.map(|Json(b)| b.reason).unwrap_or_default();
    let scope = format!("archive:{}", id);
    let (status, value) = svc
        .execute_idempotent(&org, &scope, request_id.0.as_deref(), || {
            let batch = svc.archive(&org, &id, reason, &act)?;
            Ok((200, to_body(&batch)?))
        })
        .await?;
    Ok(reply(status, value))
}

async fn transplant(
    State(svc): State<AppState>,
    tenant: Tenant,
    request_id: RequestId,
    Json(body): Json<TransplantInput>,
) -> Result<Response, ServiceError> {
    let act = actor(&tenant, &request_id);
    let org = tenant.org_id;
    let (status, value) = svc
        .execute_idempotent(&org, "transplant", request_id.0.as_deref(), || {
            let out = svc.transplant(&org, body, &act)?;
            Ok((201, to_body(&out)?))
        })
        .await?;
    Ok(reply(status, value))
}
