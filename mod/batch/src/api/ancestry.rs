use axum::{
    Json, Router,
    extract::{Path, State},
    routing::get,
};
use serde::Serialize;

use potline_core::{ServiceError, Tenant};

use super::AppState;
use crate::service::ancestry::{AncestryNode, AncestryTree};

pub fn routes() -> Router<AppState> {
    Router::new().route("/batches/{id}/ancestry", get(batch_ancestry))
}

/// Lineage in both directions: ancestors as a nearest-first list,
/// descendants as a subtree rooted at the batch itself.
#[derive(Serialize)]
struct AncestryView {
    ancestors: Vec<AncestryNode>,
    descendants: AncestryTree,
}

async fn batch_ancestry(
    State(svc): State<AppState>,
    tenant: Tenant,
    Path(id): Path<String>,
) -> Result<Json<AncestryView>, ServiceError> {
    let ancestors = svc.ancestors_of(&tenant.org_id, &id)?;
    let descendants = svc.descendants_of(&tenant.org_id, &id)?;
    Ok(Json(AncestryView { ancestors, descendants }))
}
