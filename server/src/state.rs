//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;
use std::time::Instant;

use pve_mcp::session::TokenIssuer;
use pve_mcp::Dispatcher;

#[derive(Clone)]
pub struct AppState {
    /// Operation registry and handler context, shared with every request.
    pub dispatcher: Arc<Dispatcher>,
    /// Verifies bearer tokens in [`crate::auth::require_bearer`].
    pub tokens: TokenIssuer,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
}

impl AppState {
    pub fn new(dispatcher: Arc<Dispatcher>, tokens: TokenIssuer) -> Self {
        Self {
            dispatcher,
            tokens,
            start_time: Instant::now(),
        }
    }
}
