//! Error types for billing storage.

use sprout_billing_core::CreditError;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur in storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(String),

    /// Serialization/deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Record not found.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of record.
        entity: &'static str,
        /// Identifier that was looked up.
        id: String,
    },

    /// A unique key is already taken.
    #[error("{entity} already exists: {id}")]
    AlreadyExists {
        /// Kind of record.
        entity: &'static str,
        /// Identifier that collided.
        id: String,
    },

    /// The requested change violates a balance rule.
    #[error(transparent)]
    Credit(#[from] CreditError),
}

impl StoreError {
    pub(crate) fn account_not_found(user_id: impl ToString) -> Self {
        Self::NotFound {
            entity: "account",
            id: user_id.to_string(),
        }
    }

    pub(crate) fn payment_not_found(payment_id: impl ToString) -> Self {
        Self::NotFound {
            entity: "payment",
            id: payment_id.to_string(),
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        Self::Database(e.to_string())
    }
}

#[cfg(feature = "rocksdb-backend")]
impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        Self::Database(e.to_string())
    }
}
