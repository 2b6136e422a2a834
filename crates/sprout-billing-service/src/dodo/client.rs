//! Dodo Payments API client.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::collections::BTreeMap;
use std::time::Duration;

use sprout_billing_core::CreditError;

use super::types::{
    CreatePaymentRequest, CreatePaymentResponse, Customer, DodoErrorResponse, PaymentResponse,
    ProductCartItem,
};
use crate::provider::{ChargeHandle, ChargeRequest, ChargeStatus, PaymentProvider};

/// Error type for Dodo operations.
#[derive(Debug, thiserror::Error)]
pub enum DodoError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Dodo API returned an error.
    #[error("Dodo API error ({status}): {code} - {message}")]
    Api {
        /// HTTP status.
        status: StatusCode,
        /// Error code.
        code: String,
        /// Error message.
        message: String,
    },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl From<DodoError> for CreditError {
    fn from(err: DodoError) -> Self {
        match err {
            DodoError::Http(e) if e.is_decode() => Self::ProviderError {
                code: "invalid_response".into(),
                message: e.to_string(),
            },
            DodoError::Http(e) => Self::ProviderUnavailable(e.to_string()),
            DodoError::Api { status, message, .. }
                if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS =>
            {
                Self::ProviderUnavailable(format!("HTTP {status}: {message}"))
            }
            DodoError::Api { code, message, .. } => Self::ProviderError { code, message },
            DodoError::Configuration(message) => Self::ProviderError {
                code: "not_configured".into(),
                message,
            },
        }
    }
}

/// Dodo Payments API client.
#[derive(Debug, Clone)]
pub struct DodoClient {
    client: Client,
    base_url: String,
    api_key: String,
    product_id: Option<String>,
}

impl DodoClient {
    /// Create a new Dodo client.
    ///
    /// # Arguments
    ///
    /// * `base_url` - API base, e.g. `https://test.dodopayments.com`
    /// * `api_key` - Bearer API key
    /// * `product_id` - Pay-what-you-want product used for credit packs
    ///
    /// # Errors
    ///
    /// Returns `DodoError::Http` if the HTTP client cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        product_id: Option<String>,
    ) -> Result<Self, DodoError> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            product_id,
        })
    }

    /// Create a payment with a hosted checkout link.
    ///
    /// # Errors
    ///
    /// Returns [`DodoError::Configuration`] when no product ID is set, and a
    /// transport or API error when the request fails.
    pub async fn create_payment(
        &self,
        request: &ChargeRequest,
    ) -> Result<CreatePaymentResponse, DodoError> {
        let product_id = self
            .product_id
            .clone()
            .ok_or_else(|| DodoError::Configuration("Dodo product ID not configured".into()))?;

        let mut metadata = BTreeMap::new();
        metadata.insert("payment_id".to_string(), request.payment_id.to_string());
        metadata.insert("user_id".to_string(), request.user_id.to_string());
        metadata.insert("credits".to_string(), request.credits.to_string());

        let body = CreatePaymentRequest {
            payment_link: true,
            customer: request.customer_email.clone().map(|email| Customer { email }),
            product_cart: vec![ProductCartItem {
                product_id,
                quantity: 1,
                amount: request.amount,
            }],
            return_url: request.return_url.clone(),
            billing_currency: request.currency.clone(),
            metadata,
        };

        tracing::debug!(
            payment_id = %request.payment_id,
            amount = request.amount,
            credits = request.credits,
            "Creating Dodo payment"
        );

        let response = self
            .client
            .post(format!("{}/payments", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Get a payment by provider ID, together with its raw JSON.
    ///
    /// # Errors
    ///
    /// Returns a transport or API error when the request fails, or when the
    /// body is not a payment.
    pub async fn get_payment(
        &self,
        payment_id: &str,
    ) -> Result<(PaymentResponse, serde_json::Value), DodoError> {
        let response = self
            .client
            .get(format!("{}/payments/{}", self.base_url, payment_id))
            .bearer_auth(&self.api_key)
            .send()
            .await?;

        let raw: serde_json::Value = self.handle_response(response).await?;
        let parsed = serde_json::from_value(raw.clone()).map_err(|e| DodoError::Api {
            status: StatusCode::OK,
            code: "invalid_response".into(),
            message: e.to_string(),
        })?;
        Ok((parsed, raw))
    }

    /// Handle API response and convert errors.
    async fn handle_response<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, DodoError> {
        let status = response.status();

        if status.is_success() {
            return Ok(response.json().await?);
        }

        let error_body: Result<DodoErrorResponse, _> = response.json().await;

        match error_body {
            Ok(body) => Err(DodoError::Api {
                status,
                code: body.code.unwrap_or_else(|| "unknown".to_string()),
                message: body.message.unwrap_or_else(|| format!("HTTP {status}")),
            }),
            Err(_) => Err(DodoError::Api {
                status,
                code: "unknown".to_string(),
                message: format!("HTTP {status}"),
            }),
        }
    }
}

#[async_trait]
impl PaymentProvider for DodoClient {
    async fn create_charge(&self, request: &ChargeRequest) -> Result<ChargeHandle, CreditError> {
        let created = self.create_payment(request).await?;
        Ok(ChargeHandle {
            provider_payment_id: created.payment_id,
            checkout_url: created.payment_link,
        })
    }

    async fn get_charge_status(
        &self,
        provider_payment_id: &str,
    ) -> Result<ChargeStatus, CreditError> {
        let (payment, raw) = self.get_payment(provider_payment_id).await?;
        payment.into_status(raw)
    }
}
