//! Dodo Payments wire types.

use serde::{Deserialize, Serialize};

use sprout_billing_core::{CreditError, ProviderStatus};

use crate::provider::ChargeStatus;

/// `POST /payments` request body.
#[derive(Debug, Clone, Serialize)]
pub struct CreatePaymentRequest {
    /// Return a hosted checkout link.
    pub payment_link: bool,
    /// Customer details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer: Option<Customer>,
    /// Products being bought.
    pub product_cart: Vec<ProductCartItem>,
    /// Where to send the customer afterwards.
    pub return_url: String,
    /// Billing currency.
    pub billing_currency: String,
    /// String metadata echoed back on webhooks.
    pub metadata: std::collections::BTreeMap<String, String>,
}

/// Customer details.
#[derive(Debug, Clone, Serialize)]
pub struct Customer {
    /// Customer email.
    pub email: String,
}

/// One line of the cart.
#[derive(Debug, Clone, Serialize)]
pub struct ProductCartItem {
    /// Pay-what-you-want product ID.
    pub product_id: String,
    /// Always 1 for credit packs.
    pub quantity: u32,
    /// Price override in minor units.
    pub amount: i64,
}

/// `POST /payments` response body.
#[derive(Debug, Clone, Deserialize)]
pub struct CreatePaymentResponse {
    /// Provider payment ID.
    pub payment_id: String,
    /// Hosted checkout link.
    #[serde(default)]
    pub payment_link: Option<String>,
}

/// `GET /payments/{id}` response body (fields we read).
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentResponse {
    /// Provider payment ID.
    pub payment_id: String,
    /// Status; absent while the payment has not been attempted yet.
    #[serde(default)]
    pub status: Option<String>,
    /// Total charged in minor units.
    #[serde(default)]
    pub total_amount: Option<i64>,
}

/// Error body returned by the Dodo API.
#[derive(Debug, Clone, Deserialize)]
pub struct DodoErrorResponse {
    /// Error code.
    #[serde(default)]
    pub code: Option<String>,
    /// Error message.
    #[serde(default)]
    pub message: Option<String>,
}

/// A webhook delivery.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    /// Event type, e.g. `payment.succeeded` or `dispute.opened`.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Event payload.
    pub data: WebhookData,
}

/// Payload fields used for reconciliation.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookData {
    /// Provider payment ID.
    #[serde(default)]
    pub payment_id: Option<String>,
    /// Payment status for `payment.*` events.
    #[serde(default)]
    pub status: Option<String>,
    /// Total charged in minor units.
    #[serde(default)]
    pub total_amount: Option<i64>,
    /// Everything else, kept for auditing.
    #[serde(flatten)]
    pub rest: serde_json::Map<String, serde_json::Value>,
}

impl WebhookEvent {
    /// Translate the event into a provider payment ID and status report.
    ///
    /// Returns `Ok(None)` for event types that do not affect payments.
    ///
    /// # Errors
    ///
    /// - `CreditError::UnknownProviderStatus` for a `payment.*` event whose
    ///   status is not recognised.
    /// - `CreditError::ProviderError` when a relevant event lacks a payment ID.
    pub fn report(
        &self,
        raw: &serde_json::Value,
    ) -> Result<Option<(String, ChargeStatus)>, CreditError> {
        let status = if self.event_type.starts_with("payment.") {
            match &self.data.status {
                Some(status) => status.parse()?,
                None => status_from_event_type(&self.event_type)?,
            }
        } else if matches!(self.event_type.as_str(), "dispute.opened" | "dispute.lost") {
            ProviderStatus::Disputed
        } else {
            return Ok(None);
        };

        let payment_id = self.data.payment_id.clone().ok_or_else(|| CreditError::ProviderError {
            code: "malformed_webhook".into(),
            message: format!("{} event without payment_id", self.event_type),
        })?;

        Ok(Some((
            payment_id,
            ChargeStatus {
                status,
                amount: self.data.total_amount,
                metadata: raw.clone(),
            },
        )))
    }
}

/// Fallback for payment events that omit `data.status`.
fn status_from_event_type(event_type: &str) -> Result<ProviderStatus, CreditError> {
    event_type
        .trim_start_matches("payment.")
        .parse()
        .map_err(|_| CreditError::UnknownProviderStatus(event_type.to_string()))
}

impl PaymentResponse {
    /// Convert into a status report, treating a missing status as in flight.
    ///
    /// # Errors
    ///
    /// Returns `CreditError::UnknownProviderStatus` for unrecognised statuses.
    pub fn into_status(self, raw: serde_json::Value) -> Result<ChargeStatus, CreditError> {
        let status = match self.status.as_deref() {
            Some(status) => status.parse()?,
            None => ProviderStatus::Processing,
        };
        Ok(ChargeStatus {
            status,
            amount: self.total_amount,
            metadata: raw,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(raw: &serde_json::Value) -> Option<(String, ChargeStatus)> {
        let event: WebhookEvent = serde_json::from_value(raw.clone()).unwrap();
        event.report(raw).unwrap()
    }

    #[test]
    fn payment_succeeded_maps_to_succeeded() {
        let raw = json!({
            "type": "payment.succeeded",
            "data": {"payment_id": "pay_1", "status": "succeeded", "total_amount": 1500}
        });
        let (id, report) = parse(&raw).unwrap();
        assert_eq!(id, "pay_1");
        assert_eq!(report.status, ProviderStatus::Succeeded);
        assert_eq!(report.amount, Some(1500));
        assert_eq!(report.metadata, raw);
    }

    #[test]
    fn missing_status_falls_back_to_event_type() {
        let raw = json!({"type": "payment.failed", "data": {"payment_id": "pay_1"}});
        assert_eq!(parse(&raw).unwrap().1.status, ProviderStatus::Failed);
    }

    #[test]
    fn disputes_map_to_disputed() {
        let raw = json!({
            "type": "dispute.opened",
            "data": {"payment_id": "pay_1", "amount": "1500"}
        });
        assert_eq!(parse(&raw).unwrap().1.status, ProviderStatus::Disputed);
    }

    #[test]
    fn unrelated_events_are_ignored() {
        let raw = json!({"type": "subscription.active", "data": {"subscription_id": "sub_1"}});
        assert!(parse(&raw).is_none());
    }

    #[test]
    fn unknown_payment_status_is_an_error() {
        let raw = json!({
            "type": "payment.updated",
            "data": {"payment_id": "pay_1", "status": "partially_captured"}
        });
        let event: WebhookEvent = serde_json::from_value(raw.clone()).unwrap();
        assert!(matches!(
            event.report(&raw),
            Err(CreditError::UnknownProviderStatus(s)) if s == "partially_captured"
        ));
    }

    #[test]
    fn missing_poll_status_means_processing() {
        let response = PaymentResponse {
            payment_id: "pay_1".into(),
            status: None,
            total_amount: None,
        };
        assert_eq!(
            response.into_status(serde_json::Value::Null).unwrap().status,
            ProviderStatus::Processing
        );
    }
}
