//! Tenant identity extraction.
//!
//! Authentication and session handling live in the upstream gateway; by
//! the time a request reaches this server, the gateway has resolved the
//! caller and stamped `X-Org-Id` / `X-User-Id` headers. Every read and
//! write in the batch module is scoped by the extracted `org_id` — a
//! request without one is rejected before any handler logic runs.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::error::ServiceError;

/// The resolved caller: which tenant, and (optionally) which user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tenant {
    /// Tenant id. Scopes every storage key and predicate.
    pub org_id: String,

    /// User id, when the gateway identified a person rather than a
    /// service account. Recorded on audit events.
    pub user_id: Option<String>,
}

impl<S> FromRequestParts<S> for Tenant
where
    S: Send + Sync,
{
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let org_id = parts
            .headers
            .get("x-org-id")
            .and_then(|v| v.to_str().ok())
            .filter(|s| !s.is_empty())
            .map(String::from)
            .ok_or_else(|| ServiceError::Unauthorized("missing X-Org-Id header".into()))?;

        // Storage keys are colon-delimited; an org id containing `:`
        // would alias into another tenant's key namespace.
        if org_id.contains(':') {
            return Err(ServiceError::Unauthorized(
                "invalid X-Org-Id header".into(),
            ));
        }

        let user_id = parts
            .headers
            .get("x-user-id")
            .and_then(|v| v.to_str().ok())
            .filter(|s| !s.is_empty())
            .map(String::from);

        Ok(Tenant { org_id, user_id })
    }
}

/// The caller-supplied idempotency token, from `X-Request-Id`.
///
/// Absent header means the call is not deduplicated. The raw token is
/// never used as a storage key on its own — the idempotency layer scopes
/// it by tenant and operation to avoid cross-tenant collisions when a
/// client reuses a header value.
#[derive(Debug, Clone, Default)]
pub struct RequestId(pub Option<String>);

impl<S> FromRequestParts<S> for RequestId
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let id = parts
            .headers
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .filter(|s| !s.is_empty())
            .map(String::from);
        Ok(RequestId(id))
    }
}
