//! SproutCV billing HTTP API service.
//!
//! This crate provides the HTTP API for credits and payments, including:
//!
//! - Account opening with a welcome bonus
//! - Credit balance, ledger history and ledger audit
//! - Credit usage and holds for the analysis service
//! - Dodo Payments checkout, polling and webhooks
//!
//! # Authentication
//!
//! The service supports three authentication methods:
//!
//! 1. **HS256 JWTs** - For end-user requests from the web app
//! 2. **Service API keys** - For the analysis service consuming credits
//! 3. **Admin keys** - For manual bonus and expiry adjustments
//!
//! Webhooks are authenticated by signature alone.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
// Allow some pedantic lints that are noisy for Axum handler functions
#![allow(clippy::unused_async)] // Handlers stay async for a uniform router

pub mod auth;
pub mod config;
pub mod crypto;
pub mod dodo;
pub mod error;
pub mod expiry;
pub mod handlers;
pub mod ledger;
pub mod provider;
pub mod reconciler;
pub mod routes;
pub mod state;

pub use config::ServiceConfig;
pub use dodo::{DodoClient, DodoError, WebhookVerifier};
pub use error::ApiError;
pub use expiry::ExpirySweeper;
pub use ledger::Ledger;
pub use provider::{ChargeHandle, ChargeRequest, ChargeStatus, PaymentProvider};
pub use reconciler::{Outcome, PaymentReconciler, ReconcileOutcome, ReconcilerSettings};
pub use routes::create_router;
pub use state::AppState;
