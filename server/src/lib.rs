#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

//! pve-gateway library: the HTTP router over the pve-mcp dispatcher.
//!
//! - `auth`: JWT bearer middleware producing a [`auth::Caller`]
//! - `routes`: health, tool and resource handlers
//! - `state`: shared [`AppState`]

pub mod auth;
pub mod routes;
pub mod state;

pub use state::AppState;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Build the full router. At most `max_concurrent` authenticated requests
/// are processed at once; the rest wait.
pub fn router(state: AppState, max_concurrent: usize) -> Router {
    let public_routes = Router::new().route("/api/health", get(routes::health::health));

    let authed_routes = Router::new()
        .route("/api/tools", get(routes::tools::list_tools))
        .route("/api/tools/call", post(routes::tools::call_tool))
        .route("/api/resources", get(routes::tools::list_resources))
        .route("/api/resources/read", get(routes::tools::read_resource))
        .layer(GlobalConcurrencyLimitLayer::new(max_concurrent.max(1)))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_bearer,
        ));

    Router::new()
        .merge(public_routes)
        .merge(authed_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use pve_mcp::advisor::Advisor;
    use pve_mcp::mock::MockTransport;
    use pve_mcp::rbac::Authorizer;
    use pve_mcp::session::TokenIssuer;
    use pve_mcp::webhooks::WebhookNotifier;
    use pve_mcp::{Dispatcher, GatewayContext, PveClient};
    use serde_json::{json, Map, Value};
    use tower::ServiceExt;

    use super::*;

    const SECRET: &str = "test-secret";

    async fn app(mock: &Arc<MockTransport>) -> Router {
        mock.respond("version", json!({"version": "8.2.4"}));
        let client = Arc::new(PveClient::new(Arc::clone(mock)));
        assert!(client.connect().await);
        let ctx = Arc::new(GatewayContext {
            client,
            advisor: Advisor::disabled(),
            webhooks: WebhookNotifier::disabled(),
            task_timeout: Duration::from_secs(300),
        });
        let dispatcher = Arc::new(Dispatcher::new(ctx, Authorizer::new(true)));
        let tokens = TokenIssuer::new(SECRET, "HS256", Duration::from_secs(600)).unwrap();
        router(AppState::new(dispatcher, tokens), 4)
    }

    fn token(role: &str) -> String {
        let tokens = TokenIssuer::new(SECRET, "HS256", Duration::from_secs(600)).unwrap();
        let mut claims = Map::new();
        claims.insert("sub".into(), json!("alice"));
        claims.insert("role".into(), json!(role));
        tokens.issue(claims, None).unwrap()
    }

    async fn body_json(resp: axum::response::Response) -> Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_is_public() {
        let mock = MockTransport::new();
        let app = app(&mock).await;
        let resp = app
            .oneshot(Request::get("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["operations"], 30);
    }

    #[tokio::test]
    async fn tools_require_token() {
        let mock = MockTransport::new();
        let app = app(&mock).await;
        let resp = app
            .clone()
            .oneshot(Request::get("/api/tools").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = app
            .oneshot(
                Request::get("/api/tools")
                    .header("authorization", "Bearer not-a-jwt")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn call_uses_token_role() {
        let mock = MockTransport::new();
        let app = app(&mock).await;
        let resp = app
            .oneshot(
                Request::post("/api/tools/call")
                    .header("authorization", format!("Bearer {}", token("viewer")))
                    .header("content-type", "application/json")
                    .body(Body::from(
                        json!({"name": "start_vm", "arguments": {"node": "pve1", "vmid": 101}})
                            .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        let body = body_json(resp).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["code"], "PermissionDenied");
    }

    #[tokio::test]
    async fn call_success_returns_envelope() {
        let mock = MockTransport::new();
        let app = app(&mock).await;
        mock.respond("ha_resources", json!([{"sid": "vm:101", "state": "started"}]));
        let resp = app
            .oneshot(
                Request::post("/api/tools/call")
                    .header("authorization", format!("Bearer {}", token("viewer")))
                    .header("content-type", "application/json")
                    .body(Body::from(json!({"name": "get_ha_resources"}).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["result"]["total"], 1);
    }

    #[tokio::test]
    async fn unknown_resource_is_404() {
        let mock = MockTransport::new();
        let app = app(&mock).await;
        let resp = app
            .oneshot(
                Request::get("/api/resources/read?uri=proxmox://nope")
                    .header("authorization", format!("Bearer {}", token("admin")))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
