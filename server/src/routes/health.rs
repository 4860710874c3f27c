//! Unauthenticated health-check endpoint.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::state::AppState;

/// `GET /api/health`: liveness probe.
///
/// Reports uptime, version, operation count and whether the Proxmox
/// connection validates. Validation is throttled by the client, so frequent
/// probes do not hit the cluster on every request.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let uptime = state.start_time.elapsed().as_secs();
    let client = &state.dispatcher.context().client;
    let connected = client.validate_connection().await;

    Json(json!({
        "status": if connected { "ok" } else { "degraded" },
        "uptime_secs": uptime,
        "version": env!("CARGO_PKG_VERSION"),
        "operations": state.dispatcher.list_operations().len(),
        "rbac": state.dispatcher.authorizer().is_enforcing(),
        "proxmox": {
            "endpoint": client.endpoint(),
            "connected": connected,
        },
    }))
}
