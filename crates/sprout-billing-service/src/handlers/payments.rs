//! Payment handlers.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use sprout_billing_core::{Diagnostic, Payment, PaymentId, PaymentStatus};

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::reconciler::Outcome;
use crate::state::AppState;

/// Payment response.
#[derive(Debug, Serialize)]
pub struct PaymentResponse {
    /// Local payment ID.
    pub payment_id: String,
    /// Provider payment ID.
    pub provider_payment_id: String,
    /// Hosted checkout URL.
    pub checkout_url: Option<String>,
    /// Amount in minor units.
    pub amount: i64,
    /// Currency.
    pub currency: String,
    /// Credits granted on completion.
    pub credits_purchased: i64,
    /// Current status.
    pub status: PaymentStatus,
    /// Created timestamp.
    pub created_at: String,
    /// Pending payments expire after this instant.
    pub expires_at: String,
}

impl From<&Payment> for PaymentResponse {
    fn from(payment: &Payment) -> Self {
        Self {
            payment_id: payment.id.to_string(),
            provider_payment_id: payment.provider_payment_id.clone(),
            checkout_url: payment.checkout_url.clone(),
            amount: payment.amount,
            currency: payment.currency.clone(),
            credits_purchased: payment.credits_purchased,
            status: payment.status,
            created_at: payment.created_at.to_rfc3339(),
            expires_at: payment.expires_at.to_rfc3339(),
        }
    }
}

/// Create payment request.
#[derive(Debug, Deserialize)]
pub struct CreatePaymentRequest {
    /// Amount to charge in minor units (cents).
    pub amount: i64,
    /// Credits the payment buys.
    #[serde(alias = "credits")]
    pub credits_purchased: i64,
}

/// Start a checkout for a credit pack.
pub async fn create_payment(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Json(body): Json<CreatePaymentRequest>,
) -> Result<Json<PaymentResponse>, ApiError> {
    let payment = state
        .reconciler
        .create_payment(&auth.user_id, body.amount, body.credits_purchased, auth.email)
        .await?;
    Ok(Json(PaymentResponse::from(&payment)))
}

/// Verify payment request.
#[derive(Debug, Deserialize)]
pub struct VerifyPaymentRequest {
    /// Provider payment ID returned by checkout.
    pub provider_payment_id: String,
}

/// Verify payment response.
#[derive(Debug, Serialize)]
pub struct VerifyPaymentResponse {
    /// Local payment ID.
    pub payment_id: String,
    /// Provider payment ID.
    pub provider_payment_id: String,
    /// Current status.
    pub status: PaymentStatus,
    /// Credits granted on completion.
    pub credits_purchased: i64,
    /// Whether this call credited the account.
    pub credited: bool,
    /// What the check did.
    pub outcome: Outcome,
    /// Conflicts recorded during the check.
    pub diagnostics: Vec<Diagnostic>,
}

/// Check a payment with the provider and apply the result.
pub async fn verify_payment(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Json(body): Json<VerifyPaymentRequest>,
) -> Result<Json<VerifyPaymentResponse>, ApiError> {
    let result = state
        .reconciler
        .verify_payment(&auth.user_id, &body.provider_payment_id)
        .await?;

    Ok(Json(VerifyPaymentResponse {
        payment_id: result.payment.id.to_string(),
        provider_payment_id: result.payment.provider_payment_id,
        status: result.payment.status,
        credits_purchased: result.payment.credits_purchased,
        credited: result.credited,
        outcome: result.outcome,
        diagnostics: result.diagnostics,
    }))
}

/// Payment list query parameters.
#[derive(Debug, Deserialize)]
pub struct ListPaymentsQuery {
    /// Maximum number of payments to return (default: 20, max: 100).
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Offset for pagination (default: 0).
    #[serde(default)]
    pub offset: usize,
}

fn default_limit() -> usize {
    20
}

/// Payment list response.
#[derive(Debug, Serialize)]
pub struct ListPaymentsResponse {
    /// Payments (newest first).
    pub payments: Vec<PaymentResponse>,
    /// Whether there are more payments.
    pub has_more: bool,
}

/// List the caller's payments.
pub async fn list_payments(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Query(query): Query<ListPaymentsQuery>,
) -> Result<Json<ListPaymentsResponse>, ApiError> {
    let limit = query.limit.clamp(1, 100);
    let payments = state
        .reconciler
        .list_payments(&auth.user_id, limit + 1, query.offset)
        .await?;

    let has_more = payments.len() > limit;
    Ok(Json(ListPaymentsResponse {
        payments: payments.iter().take(limit).map(PaymentResponse::from).collect(),
        has_more,
    }))
}

/// Get one of the caller's payments.
pub async fn get_payment(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Path(payment_id): Path<String>,
) -> Result<Json<PaymentResponse>, ApiError> {
    let payment_id: PaymentId = payment_id
        .parse()
        .map_err(|_| ApiError::NotFound("Payment not found".into()))?;
    let payment = state.reconciler.find_payment(&auth.user_id, &payment_id).await?;
    Ok(Json(PaymentResponse::from(&payment)))
}
