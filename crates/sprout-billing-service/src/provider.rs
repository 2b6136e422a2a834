//! Payment provider abstraction.
//!
//! The reconciler talks to the provider only through [`PaymentProvider`],
//! which keeps Dodo-specific wire formats inside [`crate::dodo`] and lets
//! tests script provider behaviour in-process.

use async_trait::async_trait;
use serde::Serialize;

use sprout_billing_core::{CreditError, PaymentId, ProviderStatus, UserId};

/// A checkout to open with the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeRequest {
    /// Local payment ID, echoed back in provider metadata.
    pub payment_id: PaymentId,
    /// The paying user.
    pub user_id: UserId,
    /// Amount in minor currency units.
    pub amount: i64,
    /// ISO currency code.
    pub currency: String,
    /// Credits the payment will grant.
    pub credits: i64,
    /// Customer email, when the identity provider supplied one.
    pub customer_email: Option<String>,
    /// Where the provider sends the customer after checkout.
    pub return_url: String,
}

/// What the provider returns for a new checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeHandle {
    /// Provider payment ID.
    pub provider_payment_id: String,
    /// Hosted checkout URL.
    pub checkout_url: Option<String>,
}

/// A status report from the provider, by poll or by webhook.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChargeStatus {
    /// Reported status.
    pub status: ProviderStatus,
    /// Reported amount in minor units, when included.
    pub amount: Option<i64>,
    /// Raw payload, stored on the payment for auditing.
    pub metadata: serde_json::Value,
}

impl ChargeStatus {
    /// A report with no amount or payload.
    #[must_use]
    pub const fn bare(status: ProviderStatus) -> Self {
        Self {
            status,
            amount: None,
            metadata: serde_json::Value::Null,
        }
    }
}

/// A hosted payments API.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Open a checkout.
    ///
    /// # Errors
    ///
    /// `CreditError::ProviderUnavailable` for transient failures,
    /// `CreditError::ProviderError` when the provider rejects the request.
    async fn create_charge(&self, request: &ChargeRequest) -> Result<ChargeHandle, CreditError>;

    /// Read the current status of a charge.
    ///
    /// # Errors
    ///
    /// As for [`PaymentProvider::create_charge`], plus
    /// `CreditError::UnknownProviderStatus` for unrecognised statuses.
    async fn get_charge_status(
        &self,
        provider_payment_id: &str,
    ) -> Result<ChargeStatus, CreditError>;
}
