//! Payment creation and verification integration tests.

mod common;

use axum::http::StatusCode;
use common::{payment_event, signed_headers, TestHarness};
use serde_json::json;

use sprout_billing_core::ProviderStatus;

async fn verify(harness: &TestHarness, provider_payment_id: &str) -> serde_json::Value {
    let (name, value) = harness.user_auth();
    let response = harness
        .server
        .post("/v1/payments/verify")
        .add_header(name, value)
        .json(&json!({ "provider_payment_id": provider_payment_id }))
        .await;
    response.assert_status_ok();
    response.json()
}

#[tokio::test]
async fn create_payment_returns_checkout() {
    let harness = TestHarness::new();
    harness.open_account().await;

    let body = harness.create_payment(1500, 15).await;
    assert_eq!(body["status"], "pending");
    assert_eq!(body["amount"], 1500);
    assert_eq!(body["credits_purchased"], 15);
    assert_eq!(body["provider_payment_id"], "pay_test_1");
    assert_eq!(body["checkout_url"], "https://checkout.test/pay_test_1");
    assert!(body["expires_at"].is_string());
    assert_eq!(harness.provider.created(), 1);
}

#[tokio::test]
async fn completion_reported_twice_credits_once() {
    let harness = TestHarness::new();
    harness.open_account().await;

    let payment = harness.create_payment(1500, 15).await;
    let id = payment["provider_payment_id"].as_str().unwrap();
    harness.provider.set_status(id, ProviderStatus::Succeeded, Some(1500));

    let first = verify(&harness, id).await;
    assert_eq!(first["status"], "completed");
    assert_eq!(first["credited"], true);
    assert_eq!(first["outcome"], "applied");

    let second = verify(&harness, id).await;
    assert_eq!(second["status"], "completed");
    assert_eq!(second["credited"], false);
    assert_eq!(second["outcome"], "already-applied");

    let body = payment_event("payment.succeeded", id, "succeeded", 1500);
    let headers = signed_headers("msg_dup", &body);
    let mut request = harness.server.post("/webhooks/payment-provider").text(body);
    for (name, value) in headers {
        request = request.add_header(name, value);
    }
    request.await.assert_status_ok();

    assert_eq!(harness.balance().await["available"], 20);
    assert_eq!(harness.entries_of_type("purchase").await, 1);
}

#[tokio::test]
async fn pending_payment_stays_pending() {
    let harness = TestHarness::new();
    harness.open_account().await;

    let payment = harness.create_payment(1500, 15).await;
    let body = verify(&harness, payment["provider_payment_id"].as_str().unwrap()).await;
    assert_eq!(body["status"], "pending");
    assert_eq!(body["outcome"], "pending");
    assert_eq!(harness.provider.polled(), 1);
}

#[tokio::test]
async fn failed_payment_grants_nothing() {
    let harness = TestHarness::new();
    harness.open_account().await;

    let payment = harness.create_payment(1500, 15).await;
    let id = payment["provider_payment_id"].as_str().unwrap();
    harness.provider.set_status(id, ProviderStatus::Failed, None);

    assert_eq!(verify(&harness, id).await["status"], "failed");
    assert_eq!(harness.balance().await["available"], 5);
    assert_eq!(harness.entries_of_type("purchase").await, 0);
}

#[tokio::test]
async fn short_amount_is_a_conflict() {
    let harness = TestHarness::new();
    harness.open_account().await;

    let payment = harness.create_payment(1500, 15).await;
    let id = payment["provider_payment_id"].as_str().unwrap();
    harness.provider.set_status(id, ProviderStatus::Succeeded, Some(100));

    let (name, value) = harness.user_auth();
    harness
        .server
        .post("/v1/payments/verify")
        .add_header(name, value)
        .json(&json!({ "provider_payment_id": id }))
        .await
        .assert_status(StatusCode::CONFLICT);
    assert_eq!(harness.balance().await["available"], 5);
}

#[tokio::test]
async fn invalid_amount_never_reaches_provider() {
    let harness = TestHarness::new();
    harness.open_account().await;

    let (name, value) = harness.user_auth();
    harness
        .server
        .post("/v1/payments")
        .add_header(name, value)
        .json(&json!({ "amount": 0, "credits_purchased": 15 }))
        .await
        .assert_status(StatusCode::BAD_REQUEST);
    assert_eq!(harness.provider.created(), 0);
}

#[tokio::test]
async fn payment_requires_an_account() {
    let harness = TestHarness::new();
    let (name, value) = harness.user_auth();
    harness
        .server
        .post("/v1/payments")
        .add_header(name, value)
        .json(&json!({ "amount": 1500, "credits_purchased": 15 }))
        .await
        .assert_status_not_found();
}

#[tokio::test]
async fn provider_rejection_is_bad_gateway() {
    let harness = TestHarness::new();
    harness.open_account().await;
    harness.provider.reject_creates("INVALID_REQUEST_BODY");

    let (name, value) = harness.user_auth();
    let response = harness
        .server
        .post("/v1/payments")
        .add_header(name, value)
        .json(&json!({ "amount": 1500, "credits_purchased": 15 }))
        .await;
    response.assert_status(StatusCode::BAD_GATEWAY);
    let body: serde_json::Value = response.json();
    assert_eq!(body["error"]["details"]["retryable"], false);

    let (name, value) = harness.user_auth();
    let listed: serde_json::Value =
        harness.server.get("/v1/payments").add_header(name, value).await.json();
    assert!(listed["payments"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn other_users_cannot_see_payments() {
    let harness = TestHarness::new();
    harness.open_account().await;
    let payment = harness.create_payment(1500, 15).await;

    let (name, value) = TestHarness::other_user_auth();
    harness
        .server
        .post("/v1/payments/verify")
        .add_header(name.clone(), value.clone())
        .json(&json!({ "provider_payment_id": payment["provider_payment_id"] }))
        .await
        .assert_status_not_found();

    harness
        .server
        .get(&format!("/v1/payments/{}", payment["payment_id"].as_str().unwrap()))
        .add_header(name, value)
        .await
        .assert_status_not_found();
}

#[tokio::test]
async fn payments_are_listed_newest_first() {
    let harness = TestHarness::new();
    harness.open_account().await;
    harness.create_payment(500, 5).await;
    harness.create_payment(1500, 15).await;

    let (name, value) = harness.user_auth();
    let response = harness
        .server
        .get("/v1/payments")
        .add_query_param("limit", 1)
        .add_header(name.clone(), value.clone())
        .await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["payments"].as_array().unwrap().len(), 1);
    assert_eq!(body["payments"][0]["provider_payment_id"], "pay_test_2");
    assert_eq!(body["has_more"], true);

    let id = body["payments"][0]["payment_id"].as_str().unwrap().to_string();
    let response = harness
        .server
        .get(&format!("/v1/payments/{id}"))
        .add_header(name, value)
        .await;
    response.assert_status_ok();
    assert_eq!(response.json::<serde_json::Value>()["amount"], 1500);
}
