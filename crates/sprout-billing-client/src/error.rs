//! Client error types.

/// Errors that can occur when using the billing client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Server returned an error response.
    #[error("API error: {code} - {message}")]
    Api {
        /// Error code.
        code: String,
        /// Error message.
        message: String,
        /// HTTP status code.
        status: u16,
        /// Whether the server marked the failure as retryable.
        retryable: bool,
    },

    /// Not enough credits for the operation.
    #[error("insufficient credits: available={available}, requested={requested}")]
    InsufficientFunds {
        /// Available credits.
        available: i64,
        /// Frozen credits.
        frozen: i64,
        /// Credits requested.
        requested: i64,
    },

    /// The caller has no billing account yet.
    #[error("account not found")]
    AccountNotFound,

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl ClientError {
    /// Whether repeating the call may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            Self::Api { retryable, .. } => *retryable,
            Self::InsufficientFunds { .. } | Self::AccountNotFound | Self::Configuration(_) => {
                false
            }
        }
    }
}
