//! Common test utilities for sprout-billing integration tests.

#![allow(dead_code)] // Some utilities are used by different test files

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::http::{HeaderName, HeaderValue};
use axum::Router;
use axum_test::TestServer;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::json;

use sprout_billing_core::{CreditError, ProviderStatus, UserId};
use sprout_billing_service::auth::JwtClaims;
use sprout_billing_service::{
    create_router, AppState, ChargeHandle, ChargeRequest, ChargeStatus, PaymentProvider,
    ServiceConfig, WebhookVerifier,
};
use sprout_billing_store::{MemoryStore, Store};

pub const JWT_SECRET: &str = "test-jwt-secret";
pub const SERVICE_API_KEY: &str = "test-service-key";
pub const ADMIN_API_KEY: &str = "test-admin-key";
pub const WEBHOOK_SECRET: &str = "whsec_dGVzdC13ZWJob29rLXNlY3JldA==";

/// In-process payment provider whose answers tests set directly.
#[derive(Default)]
pub struct FakeProvider {
    statuses: Mutex<HashMap<String, ChargeStatus>>,
    reject_creates: Mutex<Option<String>>,
    created: AtomicU32,
    polled: AtomicU32,
}

impl FakeProvider {
    /// Make `get_charge_status` report `status` for a payment.
    pub fn set_status(
        &self,
        provider_payment_id: &str,
        status: ProviderStatus,
        amount: Option<i64>,
    ) {
        self.statuses.lock().unwrap().insert(
            provider_payment_id.to_string(),
            ChargeStatus {
                status,
                amount,
                metadata: json!({ "payment_id": provider_payment_id, "status": status.as_str() }),
            },
        );
    }

    /// Make every `create_charge` fail with a provider error.
    pub fn reject_creates(&self, code: &str) {
        *self.reject_creates.lock().unwrap() = Some(code.to_string());
    }

    pub fn created(&self) -> u32 {
        self.created.load(Ordering::SeqCst)
    }

    pub fn polled(&self) -> u32 {
        self.polled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentProvider for FakeProvider {
    async fn create_charge(&self, _request: &ChargeRequest) -> Result<ChargeHandle, CreditError> {
        if let Some(code) = self.reject_creates.lock().unwrap().clone() {
            return Err(CreditError::ProviderError {
                code,
                message: "rejected by test".into(),
            });
        }
        let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(ChargeHandle {
            provider_payment_id: format!("pay_test_{n}"),
            checkout_url: Some(format!("https://checkout.test/pay_test_{n}")),
        })
    }

    async fn get_charge_status(
        &self,
        provider_payment_id: &str,
    ) -> Result<ChargeStatus, CreditError> {
        self.polled.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .statuses
            .lock()
            .unwrap()
            .get(provider_payment_id)
            .cloned()
            .unwrap_or_else(|| ChargeStatus::bare(ProviderStatus::Processing)))
    }
}

/// Test harness containing everything needed for integration tests.
pub struct TestHarness {
    /// The test server for making HTTP requests.
    pub server: TestServer,
    /// Backing store, for direct inspection.
    pub store: Arc<MemoryStore>,
    /// Scripted payment provider.
    pub provider: Arc<FakeProvider>,
    /// A test user ID for authenticated requests.
    pub test_user_id: UserId,
}

impl TestHarness {
    /// Create a new test harness with a fresh store and a webhook secret.
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    /// Create a harness after adjusting the default test configuration.
    pub fn with_config(adjust: impl FnOnce(&mut ServiceConfig)) -> Self {
        let mut config = ServiceConfig {
            listen_addr: "127.0.0.1:0".into(),
            auth_jwt_secret: Some(JWT_SECRET.into()),
            service_api_key: Some(SERVICE_API_KEY.into()),
            admin_api_key: Some(ADMIN_API_KEY.into()),
            dodo_webhook_secret: Some(WEBHOOK_SECRET.into()),
            ..ServiceConfig::default()
        };
        adjust(&mut config);

        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(FakeProvider::default());

        let state = AppState::with_provider(
            Arc::clone(&store) as Arc<dyn Store>,
            config,
            Some(Arc::clone(&provider) as Arc<dyn PaymentProvider>),
        );
        let router: Router = create_router(state);

        let server = TestServer::new(router).expect("Failed to create test server");

        Self {
            server,
            store,
            provider,
            test_user_id: UserId::generate(),
        }
    }

    /// Authorization header for the test user.
    pub fn user_auth(&self) -> (HeaderName, HeaderValue) {
        bearer(&self.test_user_id)
    }

    /// Authorization header for a different user (for testing isolation).
    pub fn other_user_auth() -> (HeaderName, HeaderValue) {
        bearer(&UserId::generate())
    }

    /// Service API key header.
    pub fn service_auth() -> (HeaderName, HeaderValue) {
        (HeaderName::from_static("x-api-key"), HeaderValue::from_static(SERVICE_API_KEY))
    }

    /// Admin key header.
    pub fn admin_auth() -> (HeaderName, HeaderValue) {
        (HeaderName::from_static("x-admin-key"), HeaderValue::from_static(ADMIN_API_KEY))
    }

    /// Open the test user's account (5 welcome credits).
    pub async fn open_account(&self) {
        let (name, value) = self.user_auth();
        self.server
            .post("/v1/accounts")
            .add_header(name, value)
            .await
            .assert_status_ok();
    }

    /// Open the account and top it up to `available` via an admin grant.
    pub async fn funded_account(&self, available: i64) {
        self.open_account().await;
        if available > 5 {
            let (name, value) = Self::admin_auth();
            self.server
                .post("/v1/credits/grant")
                .add_header(name, value)
                .json(&json!({
                    "user_id": self.test_user_id.to_string(),
                    "credits": available - 5,
                    "kind": "bonus",
                    "description": "Test funding"
                }))
                .await
                .assert_status_ok();
        }
    }

    /// Current balance body for the test user.
    pub async fn balance(&self) -> serde_json::Value {
        let (name, value) = self.user_auth();
        let response = self.server.get("/v1/credits/balance").add_header(name, value).await;
        response.assert_status_ok();
        response.json()
    }

    /// Start a checkout; returns the response body.
    pub async fn create_payment(&self, amount: i64, credits: i64) -> serde_json::Value {
        let (name, value) = self.user_auth();
        let response = self
            .server
            .post("/v1/payments")
            .add_header(name, value)
            .json(&json!({ "amount": amount, "credits_purchased": credits }))
            .await;
        response.assert_status_ok();
        response.json()
    }

    /// Number of ledger entries of `ty` for the test user.
    pub async fn entries_of_type(&self, ty: &str) -> usize {
        let (name, value) = self.user_auth();
        let response = self
            .server
            .get("/v1/credits/history")
            .add_query_param("type", ty)
            .add_query_param("limit", 100)
            .add_header(name, value)
            .await;
        response.assert_status_ok();
        let body: serde_json::Value = response.json();
        body["entries"].as_array().map_or(0, Vec::len)
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

fn bearer(user_id: &UserId) -> (HeaderName, HeaderValue) {
    let now = chrono::Utc::now().timestamp();
    let claims = JwtClaims {
        sub: user_id.to_string(),
        aud: "authenticated".into(),
        exp: now + 3600,
        iat: now,
        email: Some("test@sproutcv.test".into()),
    };
    let key = EncodingKey::from_secret(JWT_SECRET.as_bytes());
    let token = encode(&Header::default(), &claims, &key).expect("Failed to sign test token");
    (
        HeaderName::from_static("authorization"),
        HeaderValue::from_str(&format!("Bearer {token}")).expect("valid header"),
    )
}

/// Webhook body for a payment event.
pub fn payment_event(
    event_type: &str,
    provider_payment_id: &str,
    status: &str,
    amount: i64,
) -> String {
    json!({
        "business_id": "bus_test",
        "type": event_type,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "data": {
            "payload_type": "Payment",
            "payment_id": provider_payment_id,
            "status": status,
            "total_amount": amount,
            "currency": "USD"
        }
    })
    .to_string()
}

/// Standard Webhooks headers signing `body` with the test secret.
pub fn signed_headers(id: &str, body: &str) -> Vec<(HeaderName, HeaderValue)> {
    signed_headers_with(WEBHOOK_SECRET, id, chrono::Utc::now().timestamp(), body)
}

/// Standard Webhooks headers signed with an arbitrary secret and timestamp.
pub fn signed_headers_with(
    secret: &str,
    id: &str,
    timestamp: i64,
    body: &str,
) -> Vec<(HeaderName, HeaderValue)> {
    let verifier = WebhookVerifier::new(secret, std::time::Duration::from_secs(300));
    let signature = verifier.sign(id, timestamp, body);
    vec![
        (HeaderName::from_static("webhook-id"), HeaderValue::from_str(id).unwrap()),
        (
            HeaderName::from_static("webhook-timestamp"),
            HeaderValue::from_str(&timestamp.to_string()).unwrap(),
        ),
        (
            HeaderName::from_static("webhook-signature"),
            HeaderValue::from_str(&signature).unwrap(),
        ),
    ]
}
