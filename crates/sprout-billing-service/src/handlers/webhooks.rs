//! Payment provider webhooks.

use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde::Serialize;

use sprout_billing_core::CreditError;

use crate::dodo::webhook::HEADER_ID;
use crate::dodo::WebhookEvent;
use crate::error::ApiError;
use crate::state::AppState;

/// Webhook response.
#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    /// Whether the delivery was accepted.
    pub received: bool,
    /// Whether the event was applied to a payment.
    pub processed: bool,
}

impl WebhookResponse {
    const fn acknowledged(processed: bool) -> Json<Self> {
        Json(Self {
            received: true,
            processed,
        })
    }
}

/// Handle Dodo Payments webhooks.
///
/// The signature is checked before the body is parsed. Unsigned,
/// mis-signed and stale deliveries are rejected with 400, as is every
/// delivery while no webhook secret is configured. A success report whose
/// amount falls short of the payment is logged and acknowledged without
/// crediting.
pub async fn payment_provider_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<WebhookResponse>, ApiError> {
    let Some(verifier) = &state.webhook_verifier else {
        state.signature_failures.record("webhook secret not configured");
        return Err(ApiError::InvalidSignature);
    };

    if let Err(e) = verifier.verify(&headers, &body, chrono::Utc::now().timestamp()) {
        state.signature_failures.record(&e.to_string());
        return Err(ApiError::InvalidSignature);
    }

    let raw: serde_json::Value =
        serde_json::from_str(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let event: WebhookEvent =
        serde_json::from_value(raw.clone()).map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let webhook_id = headers
        .get(HEADER_ID)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    tracing::info!(
        event_type = %event.event_type,
        webhook_id = %webhook_id,
        "Received Dodo webhook"
    );

    let Some((provider_payment_id, report)) = event.report(&raw)? else {
        tracing::debug!(event_type = %event.event_type, "Unhandled Dodo event");
        return Ok(WebhookResponse::acknowledged(false));
    };

    let outcome = match state.reconciler.reconcile(&provider_payment_id, report).await {
        Ok(outcome) => outcome,
        Err(CreditError::AmountMismatch { expected, reported }) => {
            // Redelivery cannot change the amount; acknowledge and leave it for review.
            tracing::error!(
                provider_payment_id = %provider_payment_id,
                webhook_id = %webhook_id,
                expected,
                reported,
                "Webhook amount does not cover the payment; acknowledged without credit"
            );
            return Ok(WebhookResponse::acknowledged(false));
        }
        Err(e) => return Err(e.into()),
    };

    tracing::info!(
        provider_payment_id = %provider_payment_id,
        payment_id = %outcome.payment.id,
        status = %outcome.payment.status,
        outcome = ?outcome.outcome,
        credited = outcome.credited,
        "Webhook reconciled"
    );

    Ok(WebhookResponse::acknowledged(true))
}
