mod common;

use axum::http::StatusCode;
use common::{wiremock_mpesa_config, TestApp};
use rust_decimal_macros::dec;
use serde_json::json;
use uuid::Uuid;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TOKEN_PATH: &str = "/oauth/v1/generate";
const PUSH_PATH: &str = "/mpesa/stkpush/v1/processrequest";

fn token_body() -> serde_json::Value {
    json!({ "access_token": "test-access-token", "expires_in": "3599" })
}

fn push_body() -> serde_json::Value {
    json!({
        "MerchantRequestID": "29115-34620561-1",
        "CheckoutRequestID": "ws_CO_191220191020363925",
        "ResponseCode": "0",
        "ResponseDescription": "Success. Request accepted for processing",
        "CustomerMessage": "Success. Request accepted for processing"
    })
}

/// Order + pending checkout, returns the checkout id.
async fn pending_checkout(app: &TestApp) -> String {
    let user_id = Uuid::new_v4();
    let product_id = app.seed_product("Paracetamol 500mg", dec!(675.50), 10).await;
    let order = app.place_order(user_id, product_id, 2).await;

    let (status, body) = app
        .post_json(
            "/api/v1/checkout/new",
            json!({
                "orderId": order["id"],
                "phoneNumber": "0712345678",
                "deliveryAddress": "pick from pharmacy",
            }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    body["data"]["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn push_initiates_through_the_provider() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(TOKEN_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body()))
        .expect(1)
        .mount(&server)
        .await;

    // Normalized phone, whole-shilling amount rounded up, paybill type
    Mock::given(method("POST"))
        .and(path(PUSH_PATH))
        .and(body_partial_json(json!({
            "BusinessShortCode": "174379",
            "TransactionType": "CustomerPayBillOnline",
            "Amount": 1351,
            "PhoneNumber": "254712345678",
            "PartyA": "254712345678",
            "PartyB": "174379"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(push_body()))
        .expect(1)
        .mount(&server)
        .await;

    let app = TestApp::spawn_with_mpesa(wiremock_mpesa_config(&server.uri())).await;
    let checkout_id = pending_checkout(&app).await;

    let (status, body) = app
        .post_json("/api/v1/mpesa/stkpush", json!({ "checkoutId": checkout_id }))
        .await;

    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["status"], "initiated");
    assert_eq!(body["data"]["simulated"], false);
    assert_eq!(
        body["data"]["externalRequestId"],
        "ws_CO_191220191020363925"
    );
}

#[tokio::test]
async fn token_fetch_retries_transient_failures() {
    let server = MockServer::start().await;

    // First two token calls fail, the third succeeds
    Mock::given(method("GET"))
        .and(path(TOKEN_PATH))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(TOKEN_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body()))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(PUSH_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(push_body()))
        .expect(1)
        .mount(&server)
        .await;

    let app = TestApp::spawn_with_mpesa(wiremock_mpesa_config(&server.uri())).await;
    let checkout_id = pending_checkout(&app).await;

    let (status, body) = app
        .post_json("/api/v1/mpesa/stkpush", json!({ "checkoutId": checkout_id }))
        .await;

    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["status"], "initiated");
}

#[tokio::test]
async fn invalid_credentials_fail_fast_without_retry() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(TOKEN_PATH))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;

    let app = TestApp::spawn_with_mpesa(wiremock_mpesa_config(&server.uri())).await;
    let checkout_id = pending_checkout(&app).await;

    let (status, body) = app
        .post_json("/api/v1/mpesa/stkpush", json!({ "checkoutId": checkout_id }))
        .await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    // Provider details stay out of the response
    assert_eq!(body["message"], "Payment gateway error");
}

#[tokio::test]
async fn exhausted_token_retries_surface_as_unavailable() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(TOKEN_PATH))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    // allow_simulated_push is off, so no fallback
    let app = TestApp::spawn_with_mpesa(wiremock_mpesa_config(&server.uri())).await;
    let checkout_id = pending_checkout(&app).await;

    let (status, body) = app
        .post_json("/api/v1/mpesa/stkpush", json!({ "checkoutId": checkout_id }))
        .await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["message"], "Payment gateway unavailable");

    // Intent stays pending so the push can be retried later
    let (_, checkout) = app.get(&format!("/api/v1/checkout/{}", checkout_id)).await;
    assert_eq!(checkout["data"]["status"], "pending");
}

#[tokio::test]
async fn provider_rejection_leaves_intent_pending() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(TOKEN_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body()))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(PUSH_PATH))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "requestId": "1234",
            "errorCode": "400.002.02",
            "errorMessage": "Bad Request - Invalid Amount"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let app = TestApp::spawn_with_mpesa(wiremock_mpesa_config(&server.uri())).await;
    let checkout_id = pending_checkout(&app).await;

    let (status, _) = app
        .post_json("/api/v1/mpesa/stkpush", json!({ "checkoutId": checkout_id }))
        .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);

    let (_, checkout) = app.get(&format!("/api/v1/checkout/{}", checkout_id)).await;
    assert_eq!(checkout["data"]["status"], "pending");
    assert!(checkout["data"]["externalRequestId"].is_null());
}

#[tokio::test]
async fn repeated_push_does_not_hit_the_provider_again() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(TOKEN_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body()))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(PUSH_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(push_body()))
        .expect(1)
        .mount(&server)
        .await;

    let app = TestApp::spawn_with_mpesa(wiremock_mpesa_config(&server.uri())).await;
    let checkout_id = pending_checkout(&app).await;

    let (status, first) = app
        .post_json("/api/v1/mpesa/stkpush", json!({ "checkoutId": checkout_id }))
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, second) = app
        .post_json("/api/v1/mpesa/stkpush", json!({ "checkoutId": checkout_id }))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["data"]["externalRequestId"], second["data"]["externalRequestId"]);
}
