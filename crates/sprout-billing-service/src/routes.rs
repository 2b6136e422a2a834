//! Router configuration.
//!
//! This module sets up the Axum router with all routes and middleware.

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::{accounts, credits, health, payments, webhooks};
use crate::state::AppState;

// ============================================================================
// Concurrency Limiting Constants
// ============================================================================

/// Maximum concurrent requests for service credit endpoints.
const SERVICE_MAX_CONCURRENT_REQUESTS: usize = 100;

/// Maximum concurrent requests for general API endpoints.
const API_MAX_CONCURRENT_REQUESTS: usize = 50;

/// Create the service router with all routes and middleware.
///
/// # Routes
///
/// ## Public
/// - `GET /health` - Health check
///
/// ## Accounts (user JWT)
/// - `POST /v1/accounts` - Open account with welcome bonus
///
/// ## Credits (user JWT)
/// - `GET /v1/credits/balance` - Current balance
/// - `GET /v1/credits/history` - Ledger history (`limit`, `offset`, `type`)
/// - `GET /v1/credits/audit` - Replay ledger against balance
///
/// ## Credits (service API key)
/// - `POST /v1/credits/usage` - Consume credits
/// - `POST /v1/credits/freeze` - Hold credits
/// - `POST /v1/credits/unfreeze` - Release held credits
///
/// ## Credits (admin key)
/// - `POST /v1/credits/grant` - Bonus or expiry adjustment
///
/// ## Payments (user JWT)
/// - `POST /v1/payments` - Start checkout
/// - `GET /v1/payments` - List payments
/// - `GET /v1/payments/{id}` - Get payment
/// - `POST /v1/payments/verify` - Check status with the provider
///
/// ## Webhooks (signature verification)
/// - `POST /webhooks/payment-provider` - Dodo Payments webhooks
pub fn create_router(state: AppState) -> Router {
    // Extract config values before moving state
    let cors_origins = state.config.cors_origins.clone();
    let max_body_bytes = state.config.max_body_bytes;
    let request_timeout_seconds = state.config.request_timeout_seconds;

    let cors = build_cors_layer(&cors_origins);

    let state = Arc::new(state);

    // Service routes see steady traffic from the analysis service
    let service_routes = Router::new()
        .route("/usage", post(credits::usage))
        .route("/freeze", post(credits::freeze))
        .route("/unfreeze", post(credits::unfreeze))
        .layer(ConcurrencyLimitLayer::new(SERVICE_MAX_CONCURRENT_REQUESTS));

    let api_routes = Router::new()
        // Accounts
        .route("/accounts", post(accounts::open_account))
        // Credits
        .route("/credits/balance", get(credits::get_balance))
        .route("/credits/history", get(credits::history))
        .route("/credits/audit", get(credits::audit))
        .route("/credits/grant", post(credits::grant))
        .nest("/credits", service_routes)
        // Payments
        .route(
            "/payments",
            post(payments::create_payment).get(payments::list_payments),
        )
        .route("/payments/verify", post(payments::verify_payment))
        .route("/payments/:payment_id", get(payments::get_payment))
        .layer(ConcurrencyLimitLayer::new(API_MAX_CONCURRENT_REQUESTS));

    Router::new()
        // Health (public, no rate limit)
        .route("/health", get(health::health))
        // API v1 routes (rate limited)
        .nest("/v1", api_routes)
        // Webhooks (no rate limit - controlled by the provider)
        .route(
            "/webhooks/payment-provider",
            post(webhooks::payment_provider_webhook),
        )
        // Global middleware
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .layer(TimeoutLayer::new(Duration::from_secs(
            request_timeout_seconds,
        )))
        .with_state(state)
}

/// Build the CORS layer from configured origins.
fn build_cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}
