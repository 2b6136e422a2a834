//! API error types and responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use sprout_billing_core::CreditError;
use sprout_billing_store::StoreError;

/// API error type.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Unauthorized - missing or invalid credentials.
    #[error("unauthorized")]
    Unauthorized,

    /// Forbidden - valid credentials but insufficient permissions.
    #[error("forbidden")]
    Forbidden,

    /// Resource not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Bad request - invalid input.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Webhook signature could not be verified.
    #[error("invalid webhook signature")]
    InvalidSignature,

    /// Conflict - resource already exists or state disagrees.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The provider reported something this service does not understand.
    #[error("unprocessable: {0}")]
    Unprocessable(String),

    /// Insufficient credits.
    #[error("insufficient credits: available={available}, frozen={frozen}, requested={requested}")]
    InsufficientCredits {
        /// Available credits.
        available: i64,
        /// Frozen credits.
        frozen: i64,
        /// Credits requested.
        requested: i64,
    },

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),

    /// Payment provider error.
    #[error("external service error: {message}")]
    ExternalService {
        /// What went wrong.
        message: String,
        /// Whether the caller may retry.
        retryable: bool,
    },
}

/// JSON error response body.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message, details) = match &self {
            Self::Unauthorized => {
                (StatusCode::UNAUTHORIZED, "unauthorized", self.to_string(), None)
            }
            Self::Forbidden => (StatusCode::FORBIDDEN, "forbidden", self.to_string(), None),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.clone(), None),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.clone(), None),
            Self::InvalidSignature => (
                StatusCode::BAD_REQUEST,
                "invalid_signature",
                "Invalid webhook signature".to_string(),
                None,
            ),
            Self::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg.clone(), None),
            Self::Unprocessable(msg) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "unprocessable",
                msg.clone(),
                None,
            ),
            Self::InsufficientCredits {
                available,
                frozen,
                requested,
            } => (
                StatusCode::PAYMENT_REQUIRED,
                "insufficient_credits",
                self.to_string(),
                Some(serde_json::json!({
                    "available": available,
                    "frozen": frozen,
                    "requested": requested
                })),
            ),
            Self::Internal(msg) => {
                tracing::error!(error = %msg, "Internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "An internal error occurred".to_string(),
                    None,
                )
            }
            Self::ExternalService { message, retryable } => (
                StatusCode::BAD_GATEWAY,
                "external_service_error",
                message.clone(),
                Some(serde_json::json!({ "retryable": retryable })),
            ),
        };

        let body = ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message,
                details,
            },
        };

        (status, Json(body)).into_response()
    }
}

impl From<CreditError> for ApiError {
    fn from(err: CreditError) -> Self {
        let retryable = err.is_retryable();
        match err {
            CreditError::InvalidAmount(_)
            | CreditError::InvalidCredits(_)
            | CreditError::InvalidId(_) => Self::BadRequest(err.to_string()),
            CreditError::AccountNotFound { .. } => Self::NotFound("Account not found".into()),
            CreditError::UnknownPayment { .. } => Self::NotFound(err.to_string()),
            CreditError::AccountAlreadyExists { .. } | CreditError::AmountMismatch { .. } => {
                Self::Conflict(err.to_string())
            }
            CreditError::InsufficientFunds {
                available,
                frozen,
                requested,
            } => Self::InsufficientCredits {
                available,
                frozen,
                requested,
            },
            CreditError::UnknownProviderStatus(_) => Self::Unprocessable(err.to_string()),
            CreditError::ProviderUnavailable(_) | CreditError::ProviderError { .. } => {
                Self::ExternalService {
                    message: err.to_string(),
                    retryable,
                }
            }
            CreditError::WebhookSignatureInvalid(_) => Self::InvalidSignature,
            CreditError::LedgerInconsistency { .. } | CreditError::Storage(_) => {
                Self::Internal(err.to_string())
            }
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity, id } => {
                Self::NotFound(format!("{entity} not found: {id}"))
            }
            StoreError::AlreadyExists { entity, id } => {
                Self::Conflict(format!("{entity} already exists: {id}"))
            }
            StoreError::Credit(e) => e.into(),
            StoreError::Database(msg) | StoreError::Serialization(msg) => Self::Internal(msg),
        }
    }
}
