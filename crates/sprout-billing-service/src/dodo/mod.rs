//! Dodo Payments integration.
//!
//! Dodo handles:
//! - Hosted checkout links for credit packs
//! - Payment status lookups for polling
//! - Signed webhooks for payment and dispute events

pub mod client;
pub mod types;
pub mod webhook;

pub use client::{DodoClient, DodoError};
pub use types::*;
pub use webhook::{SignatureFailureMonitor, WebhookVerifier};
