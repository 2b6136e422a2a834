//! Request and response types for the billing client.

use serde::{Deserialize, Serialize};

use sprout_billing_core::{Diagnostic, PaymentStatus, TransactionType};

/// Balance response.
#[derive(Debug, Clone, Deserialize)]
pub struct BalanceResponse {
    /// User ID.
    pub user_id: String,
    /// Spendable credits.
    pub available: i64,
    /// Credits held for in-flight work.
    pub frozen: i64,
    /// Credits owed after a clawback.
    pub debt: i64,
    /// Optimistic concurrency version.
    pub version: u64,
    /// Last update timestamp.
    pub updated_at: String,
}

/// Ledger entry.
#[derive(Debug, Clone, Deserialize)]
pub struct LedgerEntry {
    /// Entry ID.
    pub id: String,
    /// Position in the user's ledger.
    pub sequence: u64,
    /// Entry type.
    pub transaction_type: TransactionType,
    /// Signed credits.
    pub credits_changed: i64,
    /// Available credits after this entry.
    pub balance_after: i64,
    /// Related payment.
    pub related_payment_id: Option<String>,
    /// Description.
    pub description: String,
    /// Entry status.
    pub status: String,
    /// Timestamp.
    pub created_at: String,
}

/// One page of ledger history.
#[derive(Debug, Clone, Deserialize)]
pub struct HistoryResponse {
    /// Entries, newest first.
    pub entries: Vec<LedgerEntry>,
    /// Whether there are more entries.
    pub has_more: bool,
}

/// History filters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HistoryQuery {
    /// Page size (server default 50, max 100).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    /// Entries to skip.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<usize>,
    /// Only entries of this type.
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub transaction_type: Option<TransactionType>,
}

/// Create payment request.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct CreatePaymentRequest {
    pub amount: i64,
    pub credits_purchased: i64,
}

/// Payment response.
#[derive(Debug, Clone, Deserialize)]
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

/// Verify payment request.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct VerifyPaymentRequest<'a> {
    pub provider_payment_id: &'a str,
}

/// Verify payment response.
#[derive(Debug, Clone, Deserialize)]
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
    /// What the check did (`applied`, `already-applied`, `rejected`, `pending`).
    pub outcome: String,
    /// Conflicts recorded during the check.
    #[serde(default)]
    pub diagnostics: Vec<Diagnostic>,
}

/// API error response.
#[derive(Debug, Deserialize)]
pub(crate) struct ApiErrorResponse {
    pub error: ApiErrorBody,
}

/// API error body.
#[derive(Debug, Deserialize)]
pub(crate) struct ApiErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub details: Option<serde_json::Value>,
}
