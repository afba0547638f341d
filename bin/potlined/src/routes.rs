//! Route registration — collects all module routes + system endpoints.

use axum::Router;
use axum::extract::Request;
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;

/// Build the complete router with all routes.
///
/// Module routes sit behind the tenant-header check; the system
/// endpoints (`/health`, `/version`) stay open for probes.
pub fn build_router(module_routes: Vec<(&str, Router)>) -> Router {
    let system_routes = Router::new()
        .route("/health", get(health))
        .route("/version", get(version));

    let mut modules = Router::new();
    for (name, router) in module_routes {
        tracing::info!(module = name, "mounting module routes");
        modules = modules.merge(router);
    }
    modules = modules.layer(middleware::from_fn(require_tenant));

    system_routes.merge(modules)
}

/// The gateway in front of this server authenticates callers and stamps
/// `X-Org-Id`/`X-User-Id`. Reject anything that arrives without a
/// tenant before it reaches a handler.
async fn require_tenant(req: Request, next: Next) -> Response {
    // Same rule as the extractor: present, non-empty, and free of the
    // storage key delimiter.
    let has_org = req
        .headers()
        .get("x-org-id")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|s| !s.is_empty() && !s.contains(':'));
    if !has_org {
        let body = axum::Json(serde_json::json!({
            "code": "UNAUTHENTICATED",
            "message": "missing or invalid X-Org-Id header",
        }));
        return (StatusCode::UNAUTHORIZED, body).into_response();
    }
    next.run(req).await
}

async fn health() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
    }))
}

async fn version() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "name": "potlined",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
