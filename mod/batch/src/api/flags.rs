use std::collections::BTreeMap;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    response::Response,
    routing::get,
};
use serde::{Deserialize, Serialize};

use potline_core::{RequestId, ServiceError, Tenant};

use super::{AppState, actor, reply, to_body};
use crate::model::BatchEvent;

pub fn routes() -> Router<AppState> {
    Router::new().route("/batches/{id}/flags", get(get_flags).patch(set_flag))
}

#[derive(Deserialize, Default)]
struct FlagsQuery {
    /// Suppress the change history in the response.
    #[serde(default)]
    history: Option<bool>,
}

#[derive(Serialize)]
struct FlagsView {
    flags: BTreeMap<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    history: Option<Vec<BatchEvent>>,
}

async fn get_flags(
    State(svc): State<AppState>,
    tenant: Tenant,
    Path(id): Path<String>,
    Query(q): Query<FlagsQuery>,
) -> Result<Json<FlagsView>, ServiceError> {
    let flags = svc.get_flags(&tenant.org_id, &id)?;
    let history = if q.history.unwrap_or(true) {
        Some(svc.flag_history(&tenant.org_id, &id)?)
    } else {
        None
    };
    Ok(Json(FlagsView { flags, history }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetFlagBody {
    key: String,
    value: serde_json::Value,
    #[serde(default)]
    reason: Option<String>,
}

async fn set_flag(
    State(svc): State<AppState>,
    tenant: Tenant,
    request_id: RequestId,
    Path(id): Path<String>,
    Json(body): Json<SetFlagBody>,
) -> Result<Response, ServiceError> {
    let act = actor(&tenant, &request_id);
    let org = tenant.org_id;
    let scope = format!("flag:{}:{}", id, body.key);
    let (status, value) = svc
        .execute_idempotent(&org, &scope, request_id.0.as_deref(), || {
            let flags = svc.set_flag(&org, &id, &body.key, body.value.clone(), body.reason.clone(), &act)?;
            Ok((200, to_body(&serde_json::json!({ "flags": flags }))?))
        })
        .await?;
    Ok(reply(status, value))
}
