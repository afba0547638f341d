pub mod ancestry;
pub mod batches;
pub mod flags;
pub mod ledger;

use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use potline_core::{RequestId, ServiceError, Tenant};

use crate::service::{Actor, BatchService};

/// Shared application state.
pub type AppState = Arc<BatchService>;

/// Build the batch API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/batch/v1", api_routes())
        .with_state(state)
}

fn api_routes() -> Router<AppState> {
    Router::new()
        .merge(batches::routes())
        .merge(ledger::routes())
        .merge(flags::routes())
        .merge(ancestry::routes())
}

pub(crate) fn actor(tenant: &Tenant, request_id: &RequestId) -> Actor {
    Actor {
        user_id: tenant.user_id.clone(),
        request_id: request_id.0.clone(),
    }
}

/// Serialize a service result into the idempotency-cacheable body form.
pub(crate) fn to_body<T: Serialize>(value: &T) -> Result<serde_json::Value, ServiceError> {
    serde_json::to_value(value).map_err(|e| ServiceError::Internal(e.to_string()))
}

/// Turn a (status, body) pair — fresh or replayed — into a response.
pub(crate) fn reply(status: u16, body: serde_json::Value) -> Response {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(body)).into_response()
}
