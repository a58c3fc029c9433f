mod common;

use axum::http::StatusCode;
use common::{simulated_mpesa_config, TestApp};
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use uuid::Uuid;

/// Seeds a product, places an order, creates a checkout and initiates a
/// (simulated) push. Returns (order_id, checkout_id, external_request_id).
async fn initiated_checkout(app: &TestApp) -> (String, String, String) {
    let user_id = Uuid::new_v4();
    let product_id = app.seed_product("Paracetamol 500mg", dec!(500.00), 10).await;
    let order = app.place_order(user_id, product_id, 2).await;
    let order_id = order["id"].as_str().unwrap().to_string();

    let (status, body) = app
        .post_json(
            "/api/v1/checkout/new",
            json!({
                "orderId": order_id,
                "phoneNumber": "0712345678",
                "deliveryAddress": "pick from pharmacy",
            }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    let checkout_id = body["data"]["id"].as_str().unwrap().to_string();

    let (status, body) = app
        .post_json("/api/v1/mpesa/stkpush", json!({ "checkoutId": checkout_id }))
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["status"], "initiated");
    assert_eq!(body["data"]["simulated"], true);
    let external_id = body["data"]["externalRequestId"]
        .as_str()
        .unwrap()
        .to_string();

    (order_id, checkout_id, external_id)
}

fn success_callback(external_id: &str, receipt: &str) -> Value {
    json!({
        "Body": {
            "stkCallback": {
                "MerchantRequestID": "29115-34620561-1",
                "CheckoutRequestID": external_id,
                "ResultCode": 0,
                "ResultDesc": "The service request is processed successfully.",
                "CallbackMetadata": {
                    "Item": [
                        { "Name": "Amount", "Value": 1000.0 },
                        { "Name": "MpesaReceiptNumber", "Value": receipt },
                        { "Name": "TransactionDate", "Value": 20240201120000i64 },
                        { "Name": "PhoneNumber", "Value": 254712345678i64 }
                    ]
                }
            }
        }
    })
}

fn failure_callback(external_id: &str) -> Value {
    json!({
        "Body": {
            "stkCallback": {
                "MerchantRequestID": "29115-34620561-1",
                "CheckoutRequestID": external_id,
                "ResultCode": 1032,
                "ResultDesc": "Request cancelled by user"
            }
        }
    })
}

#[tokio::test]
async fn success_callback_settles_intent_and_promotes_order() {
    let app = TestApp::spawn_with_mpesa(simulated_mpesa_config()).await;
    let (order_id, checkout_id, external_id) = initiated_checkout(&app).await;

    let (status, body) = app
        .post_json(
            "/api/v1/mpesa/callback",
            success_callback(&external_id, "NLJ7RT61SV"),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["message"], "Payment confirmed");

    let (_, checkout) = app.get(&format!("/api/v1/checkout/{}", checkout_id)).await;
    assert_eq!(checkout["data"]["status"], "successful");
    assert_eq!(checkout["data"]["receiptNumber"], "NLJ7RT61SV");

    let (_, order) = app.get(&format!("/api/v1/orders/{}", order_id)).await;
    assert_eq!(order["data"]["paymentStatus"], "paid");
    assert_eq!(order["data"]["status"], "processing");
}

#[tokio::test]
async fn redelivered_callback_is_acknowledged_without_changes() {
    let app = TestApp::spawn_with_mpesa(simulated_mpesa_config()).await;
    let (order_id, checkout_id, external_id) = initiated_checkout(&app).await;

    let payload = success_callback(&external_id, "NLJ7RT61SV");
    let (status, _) = app.post_json("/api/v1/mpesa/callback", payload.clone()).await;
    assert_eq!(status, StatusCode::OK);

    // Provider redelivers the same callback
    let (status, body) = app.post_json("/api/v1/mpesa/callback", payload).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Callback already processed");

    // A contradictory late failure is also ignored once terminal
    let (status, body) = app
        .post_json("/api/v1/mpesa/callback", failure_callback(&external_id))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Callback already processed");

    let (_, checkout) = app.get(&format!("/api/v1/checkout/{}", checkout_id)).await;
    assert_eq!(checkout["data"]["status"], "successful");
    let (_, order) = app.get(&format!("/api/v1/orders/{}", order_id)).await;
    assert_eq!(order["data"]["paymentStatus"], "paid");
}

#[tokio::test]
async fn failure_callback_records_failure_and_leaves_order_unpaid() {
    let app = TestApp::spawn_with_mpesa(simulated_mpesa_config()).await;
    let (order_id, checkout_id, external_id) = initiated_checkout(&app).await;

    let (status, body) = app
        .post_json("/api/v1/mpesa/callback", failure_callback(&external_id))
        .await;

    // Business failure is still acknowledged with 200
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["message"], "Payment failure recorded");

    let (_, checkout) = app.get(&format!("/api/v1/checkout/{}", checkout_id)).await;
    assert_eq!(checkout["data"]["status"], "failed");

    let (_, order) = app.get(&format!("/api/v1/orders/{}", order_id)).await;
    assert_eq!(order["data"]["paymentStatus"], "pending");
    assert_eq!(order["data"]["status"], "placed");
}

#[tokio::test]
async fn failed_intent_frees_the_order_for_a_fresh_attempt() {
    let app = TestApp::spawn_with_mpesa(simulated_mpesa_config()).await;
    let (order_id, checkout_id, external_id) = initiated_checkout(&app).await;

    app.post_json("/api/v1/mpesa/callback", failure_callback(&external_id))
        .await;

    let (status, body) = app
        .post_json(
            "/api/v1/checkout/new",
            json!({
                "orderId": order_id,
                "phoneNumber": "0712345678",
                "deliveryAddress": "pick from pharmacy",
            }),
        )
        .await;

    assert_eq!(status, StatusCode::CREATED, "{body}");
    assert_ne!(body["data"]["id"].as_str().unwrap(), checkout_id);
    assert_eq!(body["data"]["status"], "pending");
}

#[tokio::test]
async fn unknown_checkout_request_id_is_404() {
    let app = TestApp::spawn_with_mpesa(simulated_mpesa_config()).await;

    let (status, _) = app
        .post_json(
            "/api/v1/mpesa/callback",
            success_callback("ws_CO_never_issued", "XYZ123"),
        )
        .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn malformed_callback_payload_is_400() {
    let app = TestApp::spawn_with_mpesa(simulated_mpesa_config()).await;

    let (status, _) = app
        .post_json("/api/v1/mpesa/callback", json!({ "Body": { "noStkCallback": {} } }))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = app
        .post_json("/api/v1/mpesa/callback", json!("not an object"))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn duplicate_receipt_cannot_settle_a_second_intent() {
    let app = TestApp::spawn_with_mpesa(simulated_mpesa_config()).await;
    let (_, _, first_external) = initiated_checkout(&app).await;
    let (_, second_checkout, second_external) = initiated_checkout(&app).await;

    let (status, _) = app
        .post_json(
            "/api/v1/mpesa/callback",
            success_callback(&first_external, "NLJ7RT61SV"),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    // Same receipt replayed against a different intent
    let (status, _) = app
        .post_json(
            "/api/v1/mpesa/callback",
            success_callback(&second_external, "NLJ7RT61SV"),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    // The second intent was not settled
    let (_, checkout) = app.get(&format!("/api/v1/checkout/{}", second_checkout)).await;
    assert_eq!(checkout["data"]["status"], "initiated");
}

#[tokio::test]
async fn push_retry_on_initiated_intent_is_idempotent() {
    let app = TestApp::spawn_with_mpesa(simulated_mpesa_config()).await;
    let (_, checkout_id, external_id) = initiated_checkout(&app).await;

    let (status, body) = app
        .post_json("/api/v1/mpesa/stkpush", json!({ "checkoutId": checkout_id }))
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["externalRequestId"], external_id.as_str());
}

#[tokio::test]
async fn push_on_settled_intent_is_rejected() {
    let app = TestApp::spawn_with_mpesa(simulated_mpesa_config()).await;
    let (_, checkout_id, external_id) = initiated_checkout(&app).await;

    app.post_json(
        "/api/v1/mpesa/callback",
        success_callback(&external_id, "NLJ7RT61SV"),
    )
    .await;

    let (status, _) = app
        .post_json("/api/v1/mpesa/stkpush", json!({ "checkoutId": checkout_id }))
        .await;

    assert_eq!(status, StatusCode::CONFLICT);
}
