//! Credit balance, history and ledger mutation integration tests.

mod common;

use axum::http::{HeaderName, HeaderValue, StatusCode};
use common::TestHarness;
use serde_json::json;

#[tokio::test]
async fn balance_requires_an_account() {
    let harness = TestHarness::new();
    let (name, value) = harness.user_auth();
    harness
        .server
        .get("/v1/credits/balance")
        .add_header(name, value)
        .await
        .assert_status_not_found();
}

#[tokio::test]
async fn usage_within_balance_is_recorded() {
    let harness = TestHarness::new();
    harness.funded_account(20).await;

    let (name, value) = TestHarness::service_auth();
    let response = harness
        .server
        .post("/v1/credits/usage")
        .add_header(name, value)
        .add_header(HeaderName::from_static("x-service-name"), HeaderValue::from_static("analysis"))
        .json(&json!({
            "user_id": harness.test_user_id.to_string(),
            "credits": 1,
            "description": "Resume analysis"
        }))
        .await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["entry"]["transaction_type"], "usage");
    assert_eq!(body["entry"]["credits_changed"], -1);
    assert_eq!(body["entry"]["balance_after"], 19);
    assert_eq!(body["balance"]["available"], 19);
}

#[tokio::test]
async fn usage_beyond_balance_is_payment_required() {
    let harness = TestHarness::new();
    harness.funded_account(20).await;

    let (name, value) = TestHarness::service_auth();
    let response = harness
        .server
        .post("/v1/credits/usage")
        .add_header(name, value)
        .json(&json!({
            "user_id": harness.test_user_id.to_string(),
            "credits": 25
        }))
        .await;
    response.assert_status(StatusCode::PAYMENT_REQUIRED);
    let body: serde_json::Value = response.json();
    assert_eq!(body["error"]["code"], "insufficient_credits");
    assert_eq!(body["error"]["details"]["available"], 20);
    assert_eq!(body["error"]["details"]["requested"], 25);

    assert_eq!(harness.balance().await["available"], 20);
    assert_eq!(harness.entries_of_type("usage").await, 0);
}

#[tokio::test]
async fn usage_requires_service_key() {
    let harness = TestHarness::new();
    harness.open_account().await;

    harness
        .server
        .post("/v1/credits/usage")
        .add_header(HeaderName::from_static("x-api-key"), HeaderValue::from_static("wrong"))
        .json(&json!({ "user_id": harness.test_user_id.to_string(), "credits": 1 }))
        .await
        .assert_status_unauthorized();
}

#[tokio::test]
async fn non_positive_credits_are_rejected() {
    let harness = TestHarness::new();
    harness.open_account().await;

    let (name, value) = TestHarness::service_auth();
    harness
        .server
        .post("/v1/credits/usage")
        .add_header(name, value)
        .json(&json!({ "user_id": harness.test_user_id.to_string(), "credits": 0 }))
        .await
        .assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn freeze_and_unfreeze_move_between_sub_balances() {
    let harness = TestHarness::new();
    harness.funded_account(10).await;
    let user_id = harness.test_user_id.to_string();

    let (name, value) = TestHarness::service_auth();
    harness
        .server
        .post("/v1/credits/freeze")
        .add_header(name.clone(), value.clone())
        .json(&json!({ "user_id": user_id, "credits": 4 }))
        .await
        .assert_status_ok();

    let balance = harness.balance().await;
    assert_eq!(balance["available"], 6);
    assert_eq!(balance["frozen"], 4);

    harness
        .server
        .post("/v1/credits/unfreeze")
        .add_header(name.clone(), value.clone())
        .json(&json!({ "user_id": user_id, "credits": 5 }))
        .await
        .assert_status(StatusCode::PAYMENT_REQUIRED);

    harness
        .server
        .post("/v1/credits/unfreeze")
        .add_header(name, value)
        .json(&json!({ "user_id": user_id, "credits": 4 }))
        .await
        .assert_status_ok();

    let balance = harness.balance().await;
    assert_eq!(balance["available"], 10);
    assert_eq!(balance["frozen"], 0);
}

#[tokio::test]
async fn admin_expiry_removes_credits() {
    let harness = TestHarness::new();
    harness.funded_account(10).await;

    let (name, value) = TestHarness::admin_auth();
    harness
        .server
        .post("/v1/credits/grant")
        .add_header(name, value)
        .add_header(HeaderName::from_static("x-admin-id"), HeaderValue::from_static("ops"))
        .json(&json!({
            "user_id": harness.test_user_id.to_string(),
            "credits": 3,
            "kind": "expiry",
            "description": "Expired promo credits"
        }))
        .await
        .assert_status_ok();

    assert_eq!(harness.balance().await["available"], 7);
    assert_eq!(harness.entries_of_type("expiry").await, 1);
}

#[tokio::test]
async fn grant_requires_admin_key() {
    let harness = TestHarness::new();
    harness.open_account().await;

    let (name, value) = TestHarness::service_auth();
    harness
        .server
        .post("/v1/credits/grant")
        .add_header(name, value)
        .json(&json!({
            "user_id": harness.test_user_id.to_string(),
            "credits": 100,
            "kind": "bonus",
            "description": "nope"
        }))
        .await
        .assert_status_unauthorized();
}

#[tokio::test]
async fn history_pages_newest_first() {
    let harness = TestHarness::new();
    harness.funded_account(10).await;

    let (name, value) = TestHarness::service_auth();
    for _ in 0..3 {
        harness
            .server
            .post("/v1/credits/usage")
            .add_header(name.clone(), value.clone())
            .json(&json!({ "user_id": harness.test_user_id.to_string(), "credits": 1 }))
            .await
            .assert_status_ok();
    }

    let (name, value) = harness.user_auth();
    let response = harness
        .server
        .get("/v1/credits/history")
        .add_query_param("limit", 2)
        .add_header(name.clone(), value.clone())
        .await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    let entries = body["entries"].as_array().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(body["has_more"], true);
    assert_eq!(entries[0]["sequence"], 5);
    assert_eq!(entries[0]["balance_after"], 7);

    harness
        .server
        .get("/v1/credits/history")
        .add_query_param("type", "rebate")
        .add_header(name, value)
        .await
        .assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn audit_confirms_replay() {
    let harness = TestHarness::new();
    harness.funded_account(10).await;

    let (name, value) = harness.user_auth();
    let response = harness.server.get("/v1/credits/audit").add_header(name, value).await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["consistent"], true);
    assert_eq!(body["replay"]["net"], 10);
    assert_eq!(body["replay"]["entries"], 2);
}
