//! API handlers.

#![allow(clippy::missing_errors_doc)] // Axum handlers all return Result

pub mod accounts;
pub mod credits;
pub mod health;
pub mod payments;
pub mod webhooks;
