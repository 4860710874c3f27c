//! JWT bearer authentication.
//!
//! Every endpoint except `/api/health` requires an
//! `Authorization: Bearer <jwt>` header signed with the configured secret.
//! The token's `sub` and `role` claims become the request's [`Caller`].

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use pve_mcp::session::caller_role;
use serde_json::json;

use crate::state::AppState;

/// Identity attached to authenticated requests as an extension.
#[derive(Debug, Clone)]
pub struct Caller {
    pub subject: String,
    pub role: String,
}

/// Axum middleware that rejects requests without a valid bearer token.
///
/// # Error responses
///
/// - `401 Unauthorized`: header missing or malformed
/// - `403 Forbidden`: token invalid, expired, or without a `role` claim
pub async fn require_bearer(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let auth_header = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok());

    let Some(token) = auth_header.and_then(|h| h.strip_prefix("Bearer ")) else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "Missing or invalid Authorization header"})),
        )
            .into_response();
    };

    let Some(claims) = state.tokens.verify(token.trim()) else {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({"error": "Invalid or expired token"})),
        )
            .into_response();
    };

    let Some(role) = caller_role(&claims) else {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({"error": "Token carries no role"})),
        )
            .into_response();
    };

    let caller = Caller {
        subject: claims
            .get("sub")
            .and_then(|s| s.as_str())
            .unwrap_or("anonymous")
            .to_string(),
        role: role.to_string(),
    };
    tracing::debug!(subject = %caller.subject, role = %caller.role, "Authenticated request");
    request.extensions_mut().insert(caller);
    next.run(request).await
}
