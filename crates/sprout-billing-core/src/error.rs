//! Error types for SproutCV billing.

use serde::{Deserialize, Serialize};

use crate::ids::IdError;
use crate::{PaymentStatus, ProviderStatus};

/// Result type for billing operations.
pub type Result<T> = std::result::Result<T, CreditError>;

/// Errors that can occur in credit ledger and payment operations.
#[derive(Debug, thiserror::Error)]
pub enum CreditError {
    /// A payment amount was zero or negative.
    #[error("invalid amount: {0}")]
    InvalidAmount(i64),

    /// A credit quantity was zero, had the wrong sign, or overflowed.
    #[error("invalid credits: {0}")]
    InvalidCredits(String),

    /// No balance exists for the user.
    #[error("account not found: {user_id}")]
    AccountNotFound {
        /// The user ID that was not found.
        user_id: String,
    },

    /// A balance already exists for the user.
    #[error("account already exists: {user_id}")]
    AccountAlreadyExists {
        /// The user ID that already has an account.
        user_id: String,
    },

    /// The mutation would drive `available` or `frozen` below zero.
    #[error("insufficient funds: available={available}, frozen={frozen}, requested={requested}")]
    InsufficientFunds {
        /// Available credits at the time of the attempt.
        available: i64,
        /// Frozen credits at the time of the attempt.
        frozen: i64,
        /// Credits the operation tried to take.
        requested: i64,
    },

    /// Replaying the ledger disagrees with the stored balance.
    #[error("ledger inconsistency for {user_id}: {detail}")]
    LedgerInconsistency {
        /// The affected user.
        user_id: String,
        /// What disagreed, with expected and actual values.
        detail: String,
    },

    /// No local payment matches the provider's payment ID.
    #[error("unknown payment: {provider_payment_id}")]
    UnknownPayment {
        /// The provider's payment ID.
        provider_payment_id: String,
    },

    /// The provider reported a status this service does not recognise.
    #[error("unknown provider status: {0}")]
    UnknownProviderStatus(String),

    /// The provider reported a smaller amount than was charged.
    #[error("amount mismatch: expected {expected}, reported {reported}")]
    AmountMismatch {
        /// Amount recorded locally, in minor units.
        expected: i64,
        /// Amount the provider reported, in minor units.
        reported: i64,
    },

    /// The payment provider could not be reached or is temporarily failing.
    #[error("payment provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// The payment provider rejected the request.
    #[error("payment provider error: {code} - {message}")]
    ProviderError {
        /// Provider error code.
        code: String,
        /// Provider error message.
        message: String,
    },

    /// A webhook failed signature verification.
    #[error("invalid webhook signature: {0}")]
    WebhookSignatureInvalid(String),

    /// Invalid identifier.
    #[error("invalid identifier: {0}")]
    InvalidId(#[from] IdError),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(String),
}

impl CreditError {
    /// Whether retrying the same call later may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::ProviderUnavailable(_))
    }
}

/// Non-fatal findings recorded while applying a provider-driven transition.
///
/// These never block the authoritative transition; they are logged and
/// returned to the caller for auditing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Diagnostic {
    /// The provider reported a terminal status different from the local one.
    StateConflict {
        /// Local status before the report.
        local: PaymentStatus,
        /// Status the provider reported.
        reported: ProviderStatus,
        /// Whether the report was applied.
        applied: bool,
    },

    /// A clawback exceeded the available balance; the shortfall became debt.
    NegativeBalanceWarning {
        /// Credits that could not be taken from `available`.
        shortfall: i64,
        /// Total outstanding debt after the clawback.
        debt_after: i64,
    },
}
