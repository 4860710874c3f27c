//! Operation and resource endpoints.
//!
//! Bodies are always the `{success, result?, error?}` envelope; the HTTP
//! status mirrors the error code so plain HTTP clients can branch on it.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    Extension, Json,
};
use pve_mcp::Envelope;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::auth::Caller;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CallRequest {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

#[derive(Debug, Deserialize)]
pub struct ReadQuery {
    pub uri: String,
}

/// HTTP status for an envelope.
pub fn status_for(envelope: &Envelope) -> StatusCode {
    let Some(err) = &envelope.error else {
        return StatusCode::OK;
    };
    match err.code.as_str() {
        "ValidationError" => StatusCode::UNPROCESSABLE_ENTITY,
        "PermissionDenied" => StatusCode::FORBIDDEN,
        "UnknownOperation" | "UnknownResource" | "ResourceNotFound" => StatusCode::NOT_FOUND,
        "TimeoutError" => StatusCode::GATEWAY_TIMEOUT,
        "ConnectionError" | "OperationFailed" | "RemoteError" => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// `GET /api/tools`: operation definitions in registration order.
pub async fn list_tools(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "tools": state.dispatcher.list_operations() }))
}

/// `POST /api/tools/call`: run one operation as the authenticated caller.
pub async fn call_tool(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Json(req): Json<CallRequest>,
) -> (StatusCode, Json<Value>) {
    let args = if req.arguments.is_null() {
        json!({})
    } else {
        req.arguments
    };
    tracing::info!(subject = %caller.subject, role = %caller.role, operation = %req.name, "Tool call");
    let envelope = state
        .dispatcher
        .call_operation(&req.name, &args, &caller.role)
        .await;
    (status_for(&envelope), Json(envelope.to_value()))
}

/// `GET /api/resources`
pub async fn list_resources(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "resources": state.dispatcher.list_resources() }))
}

/// `GET /api/resources/read?uri=...`
pub async fn read_resource(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Query(query): Query<ReadQuery>,
) -> (StatusCode, Json<Value>) {
    let envelope = state
        .dispatcher
        .read_resource(&query.uri, &caller.role)
        .await;
    (status_for(&envelope), Json(envelope.to_value()))
}
