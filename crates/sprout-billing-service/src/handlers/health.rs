//! Health check handler.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::state::AppState;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` while the process serves requests.
    pub status: &'static str,
    /// Service name.
    pub service: &'static str,
    /// Crate version.
    pub version: &'static str,
    /// Whether checkouts can be created.
    pub payments_enabled: bool,
    /// Whether webhook deliveries can be verified.
    pub webhooks_enabled: bool,
}

/// Health check endpoint.
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "sprout-billing",
        version: env!("CARGO_PKG_VERSION"),
        payments_enabled: state.reconciler.has_provider(),
        webhooks_enabled: state.webhook_verifier.is_some(),
    })
}
