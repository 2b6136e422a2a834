//! SproutCV billing HTTP client implementation.

use reqwest::Client;
use std::time::Duration;

use crate::error::ClientError;
use crate::types::{
    ApiErrorResponse, BalanceResponse, CreatePaymentRequest, HistoryQuery, HistoryResponse,
    PaymentResponse, VerifyPaymentRequest, VerifyPaymentResponse,
};

/// Billing API client for an authenticated end user.
#[derive(Debug, Clone)]
pub struct SproutBillingClient {
    client: Client,
    base_url: String,
    token: String,
}

impl SproutBillingClient {
    /// Create a new billing client.
    ///
    /// # Arguments
    ///
    /// * `base_url` - Base URL of the billing service (e.g., `"http://sprout-billing:8080"`)
    /// * `token` - The user's JWT
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Configuration` if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self, ClientError> {
        Self::with_options(base_url, token, ClientOptions::default())
    }

    /// Create a new billing client with custom options.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Configuration` if the HTTP client cannot be built.
    pub fn with_options(
        base_url: impl Into<String>,
        token: impl Into<String>,
        options: ClientOptions,
    ) -> Result<Self, ClientError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(options.timeout_seconds))
            .build()
            .map_err(|e| ClientError::Configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    /// Get the user's current balance.
    ///
    /// # Errors
    ///
    /// `ClientError::AccountNotFound` before the account is opened.
    pub async fn balance(&self) -> Result<BalanceResponse, ClientError> {
        let url = format!("{}/v1/credits/balance", self.base_url);
        let response = self.client.get(&url).bearer_auth(&self.token).send().await?;
        self.handle_response(response).await
    }

    /// Get a page of ledger history, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error.
    pub async fn history(&self, query: &HistoryQuery) -> Result<HistoryResponse, ClientError> {
        let url = format!("{}/v1/credits/history", self.base_url);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .query(query)
            .send()
            .await?;
        self.handle_response(response).await
    }

    /// Start a checkout for a credit pack.
    ///
    /// `amount` is in minor currency units.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error.
    pub async fn create_payment(
        &self,
        amount: i64,
        credits_purchased: i64,
    ) -> Result<PaymentResponse, ClientError> {
        let url = format!("{}/v1/payments", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(&CreatePaymentRequest {
                amount,
                credits_purchased,
            })
            .send()
            .await?;
        self.handle_response(response).await
    }

    /// Ask the service to check a payment with the provider once.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error.
    pub async fn verify_payment(
        &self,
        provider_payment_id: &str,
    ) -> Result<VerifyPaymentResponse, ClientError> {
        let url = format!("{}/v1/payments/verify", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(&VerifyPaymentRequest { provider_payment_id })
            .send()
            .await?;
        self.handle_response(response).await
    }

    /// Verify a payment every `interval` until it reaches a terminal status
    /// or `timeout` elapses.
    ///
    /// Returns the last response either way; callers check `status`.
    /// Retryable failures are logged and polled through.
    ///
    /// # Errors
    ///
    /// Non-retryable API errors, or a retryable error from the final check.
    pub async fn wait_for_payment(
        &self,
        provider_payment_id: &str,
        timeout: Duration,
        interval: Duration,
    ) -> Result<VerifyPaymentResponse, ClientError> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let result = self.verify_payment(provider_payment_id).await;
            match &result {
                Ok(response) if response.status.is_terminal() => return result,
                Err(e) if !e.is_retryable() => return result,
                Err(e) => tracing::warn!(
                    provider_payment_id = %provider_payment_id,
                    error = %e,
                    "Payment check failed, will retry"
                ),
                Ok(_) => {}
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                tracing::debug!(
                    provider_payment_id = %provider_payment_id,
                    "Gave up waiting for payment"
                );
                return result;
            }
            tokio::time::sleep(interval.min(deadline - now)).await;
        }
    }

    /// Handle API response and convert errors.
    async fn handle_response<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, ClientError> {
        let status = response.status();

        if status.is_success() {
            return Ok(response.json().await?);
        }

        let error_body: Result<ApiErrorResponse, _> = response.json().await;

        match error_body {
            Ok(api_error) => {
                let details = api_error.error.details.as_ref();
                let field = |name: &str| {
                    details
                        .and_then(|d| d.get(name))
                        .and_then(serde_json::Value::as_i64)
                        .unwrap_or(0)
                };

                match api_error.error.code.as_str() {
                    "insufficient_credits" => Err(ClientError::InsufficientFunds {
                        available: field("available"),
                        frozen: field("frozen"),
                        requested: field("requested"),
                    }),
                    "not_found" if api_error.error.message.starts_with("Account") => {
                        Err(ClientError::AccountNotFound)
                    }
                    code => Err(ClientError::Api {
                        code: code.to_string(),
                        retryable: details
                            .and_then(|d| d.get("retryable"))
                            .and_then(serde_json::Value::as_bool)
                            .unwrap_or(false),
                        message: api_error.error.message,
                        status: status.as_u16(),
                    }),
                }
            }
            Err(_) => Err(ClientError::Api {
                code: "unknown".to_string(),
                message: format!("HTTP {status}"),
                status: status.as_u16(),
                retryable: status.is_server_error(),
            }),
        }
    }
}

/// Client options for customization.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Request timeout in seconds (default: 30).
    pub timeout_seconds: u64,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self { timeout_seconds: 30 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sprout_billing_core::PaymentStatus;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn verify_body(status: &str, credited: bool) -> serde_json::Value {
        json!({
            "payment_id": "8d3c2f5e-1b7a-4c9d-a2e6-5f4b3c2d1e0f",
            "provider_payment_id": "pay_1",
            "status": status,
            "credits_purchased": 15,
            "credited": credited,
            "outcome": if credited { "applied" } else { "pending" },
            "diagnostics": []
        })
    }

    #[test]
    fn client_trims_trailing_slash() {
        let client = SproutBillingClient::new("http://localhost:8080/", "jwt").unwrap();
        assert_eq!(client.base_url, "http://localhost:8080");
    }

    #[tokio::test]
    async fn balance_sends_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/credits/balance"))
            .and(header("authorization", "Bearer jwt"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "user_id": "5f0c7c2e-8f6b-4d4e-9a57-2f1d3c4b5a69",
                "available": 20,
                "frozen": 0,
                "debt": 0,
                "version": 3,
                "updated_at": "2026-01-01T00:00:00Z"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = SproutBillingClient::new(server.uri(), "jwt").unwrap();
        let balance = client.balance().await.unwrap();
        assert_eq!(balance.available, 20);
        assert_eq!(balance.version, 3);
    }

    #[tokio::test]
    async fn history_passes_filters() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/credits/history"))
            .and(query_param("type", "purchase"))
            .and(query_param("limit", "10"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "entries": [{
                    "id": "01HZY3Q5V8N2X7K4M6P9R0T1W3",
                    "sequence": 2,
                    "transaction_type": "purchase",
                    "credits_changed": 15,
                    "balance_after": 20,
                    "related_payment_id": "8d3c2f5e-1b7a-4c9d-a2e6-5f4b3c2d1e0f",
                    "description": "Credit purchase",
                    "status": "completed",
                    "created_at": "2026-01-01T00:00:00Z"
                }],
                "has_more": false
            })))
            .mount(&server)
            .await;

        let client = SproutBillingClient::new(server.uri(), "jwt").unwrap();
        let page = client
            .history(&HistoryQuery {
                limit: Some(10),
                offset: None,
                transaction_type: Some(sprout_billing_core::TransactionType::Purchase),
            })
            .await
            .unwrap();
        assert_eq!(page.entries.len(), 1);
        assert_eq!(page.entries[0].credits_changed, 15);
    }

    #[tokio::test]
    async fn create_payment_posts_pack() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/payments"))
            .and(body_json(json!({ "amount": 1500, "credits_purchased": 15 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "payment_id": "8d3c2f5e-1b7a-4c9d-a2e6-5f4b3c2d1e0f",
                "provider_payment_id": "pay_1",
                "checkout_url": "https://checkout.dodopayments.com/pay_1",
                "amount": 1500,
                "currency": "USD",
                "credits_purchased": 15,
                "status": "pending",
                "created_at": "2026-01-01T00:00:00Z",
                "expires_at": "2026-01-01T00:05:00Z"
            })))
            .mount(&server)
            .await;

        let client = SproutBillingClient::new(server.uri(), "jwt").unwrap();
        let payment = client.create_payment(1500, 15).await.unwrap();
        assert_eq!(payment.status, PaymentStatus::Pending);
        assert_eq!(payment.provider_payment_id, "pay_1");
    }

    #[tokio::test]
    async fn insufficient_credits_is_typed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/credits/balance"))
            .respond_with(ResponseTemplate::new(402).set_body_json(json!({
                "error": {
                    "code": "insufficient_credits",
                    "message": "insufficient credits",
                    "details": { "available": 20, "frozen": 0, "requested": 25 }
                }
            })))
            .mount(&server)
            .await;

        let client = SproutBillingClient::new(server.uri(), "jwt").unwrap();
        let err = client.balance().await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::InsufficientFunds {
                available: 20,
                requested: 25,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn missing_account_is_typed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/credits/balance"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "error": { "code": "not_found", "message": "Account not found" }
            })))
            .mount(&server)
            .await;

        let client = SproutBillingClient::new(server.uri(), "jwt").unwrap();
        assert!(matches!(client.balance().await, Err(ClientError::AccountNotFound)));
    }

    #[tokio::test]
    async fn wait_returns_once_terminal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/payments/verify"))
            .respond_with(ResponseTemplate::new(200).set_body_json(verify_body("pending", false)))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/payments/verify"))
            .respond_with(ResponseTemplate::new(200).set_body_json(verify_body("completed", true)))
            .mount(&server)
            .await;

        let client = SproutBillingClient::new(server.uri(), "jwt").unwrap();
        let result = client
            .wait_for_payment("pay_1", Duration::from_secs(5), Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(result.status, PaymentStatus::Completed);
        assert!(result.credited);
    }

    #[tokio::test]
    async fn wait_gives_up_at_deadline() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/payments/verify"))
            .respond_with(ResponseTemplate::new(200).set_body_json(verify_body("pending", false)))
            .mount(&server)
            .await;

        let client = SproutBillingClient::new(server.uri(), "jwt").unwrap();
        let result = client
            .wait_for_payment("pay_1", Duration::from_millis(50), Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(result.status, PaymentStatus::Pending);
    }

    #[tokio::test]
    async fn wait_stops_on_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/payments/verify"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "error": { "code": "not_found", "message": "unknown payment: pay_1" }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = SproutBillingClient::new(server.uri(), "jwt").unwrap();
        let err = client
            .wait_for_payment("pay_1", Duration::from_secs(5), Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Api { status: 404, .. }));
    }
}
