mod common;

use axum::http::StatusCode;
use common::TestApp;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use uuid::Uuid;

/// Decimal fields may serialize as string or number depending on scale
fn as_decimal(value: &Value) -> Decimal {
    match value {
        Value::String(s) => s.parse().expect("decimal string"),
        Value::Number(n) => n.to_string().parse().expect("decimal number"),
        other => panic!("not a decimal value: {other:?}"),
    }
}

#[tokio::test]
async fn cart_becomes_order_with_delivery_fee_and_cart_clears() {
    let app = TestApp::spawn().await;
    let user_id = Uuid::new_v4();
    let product_id = app.seed_product("Paracetamol 500mg", dec!(250.00), 10).await;

    let order = app.place_order(user_id, product_id, 3).await;

    assert_eq!(as_decimal(&order["subtotal"]), dec!(750));
    assert_eq!(as_decimal(&order["deliveryFee"]), dec!(150));
    assert_eq!(as_decimal(&order["totalAmount"]), dec!(900));
    assert_eq!(order["status"], "placed");
    assert_eq!(order["paymentStatus"], "pending");
    assert!(order["orderNumber"].as_str().unwrap().starts_with("OR"));
    assert_eq!(order["items"].as_array().unwrap().len(), 1);

    // Cart is consumed by the order
    let (status, cart) = app.get(&format!("/api/v1/cart/{}", user_id)).await;
    assert_eq!(status, StatusCode::OK);
    assert!(cart["data"]["items"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn empty_cart_cannot_become_an_order() {
    let app = TestApp::spawn().await;

    let (status, body) = app
        .post_json("/api/v1/orders", json!({ "userId": Uuid::new_v4() }))
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"].as_str().unwrap().contains("empty"));
}

#[tokio::test]
async fn checkout_charges_delivery_fee_for_delivery_address() {
    let app = TestApp::spawn().await;
    let user_id = Uuid::new_v4();
    let product_id = app.seed_product("Amoxicillin 250mg", dec!(400.00), 5).await;
    let order = app.place_order(user_id, product_id, 2).await;

    let (status, body) = app
        .post_json(
            "/api/v1/checkout/new",
            json!({
                "orderId": order["id"],
                "phoneNumber": "0712345678",
                "deliveryAddress": "12 Riverside Drive, Nairobi",
            }),
        )
        .await;

    assert_eq!(status, StatusCode::CREATED, "{body}");
    let checkout = &body["data"];
    // subtotal 800 + stored fee 150
    assert_eq!(as_decimal(&checkout["amount"]), dec!(950));
    assert_eq!(checkout["status"], "pending");
    assert!(checkout["intentNumber"].as_str().unwrap().starts_with("CO"));
}

#[tokio::test]
async fn pickup_address_waives_delivery_fee() {
    let app = TestApp::spawn().await;
    let user_id = Uuid::new_v4();
    let product_id = app.seed_product("Ibuprofen 400mg", dec!(300.00), 5).await;
    let order = app.place_order(user_id, product_id, 1).await;

    let (status, body) = app
        .post_json(
            "/api/v1/checkout/new",
            json!({
                "orderId": order["id"],
                "phoneNumber": "0712345678",
                // Capitalization differs from the canonical sentinel on purpose
                "deliveryAddress": "Pick From Pharmacy",
            }),
        )
        .await;

    assert_eq!(status, StatusCode::CREATED, "{body}");
    assert_eq!(as_decimal(&body["data"]["amount"]), dec!(300));
}

#[tokio::test]
async fn checkout_for_unknown_order_is_404() {
    let app = TestApp::spawn().await;

    let (status, _) = app
        .post_json(
            "/api/v1/checkout/new",
            json!({
                "orderId": Uuid::new_v4(),
                "phoneNumber": "0712345678",
                "deliveryAddress": "pick from pharmacy",
            }),
        )
        .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn checkout_retry_returns_the_live_intent() {
    let app = TestApp::spawn().await;
    let user_id = Uuid::new_v4();
    let product_id = app.seed_product("Cetirizine 10mg", dec!(150.00), 5).await;
    let order = app.place_order(user_id, product_id, 1).await;

    let request = json!({
        "orderId": order["id"],
        "phoneNumber": "0712345678",
        "deliveryAddress": "pick from pharmacy",
    });

    let (_, first) = app.post_json("/api/v1/checkout/new", request.clone()).await;
    let (status, second) = app.post_json("/api/v1/checkout/new", request).await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(first["data"]["id"], second["data"]["id"]);
    assert_eq!(first["data"]["intentNumber"], second["data"]["intentNumber"]);
}

#[tokio::test]
async fn cancelled_order_cannot_be_checked_out() {
    let app = TestApp::spawn().await;
    let user_id = Uuid::new_v4();
    let product_id = app.seed_product("Loratadine 10mg", dec!(200.00), 5).await;
    let order = app.place_order(user_id, product_id, 1).await;

    let (status, _) = app
        .post_json(
            &format!("/api/v1/orders/{}/cancel", order["id"].as_str().unwrap()),
            json!({ "userId": user_id }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

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

    assert_eq!(status, StatusCode::CONFLICT, "{body}");
}

#[tokio::test]
async fn order_listing_is_paginated_per_user() {
    let app = TestApp::spawn().await;
    let user_id = Uuid::new_v4();
    let other_user = Uuid::new_v4();
    let product_id = app.seed_product("Vitamin C 1000mg", dec!(100.00), 50).await;

    for _ in 0..3 {
        app.place_order(user_id, product_id, 1).await;
    }
    app.place_order(other_user, product_id, 1).await;

    let (status, body) = app
        .get(&format!("/api/v1/orders?userId={}&page=1&perPage=2", user_id))
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["total"], 3);
    assert_eq!(body["data"]["items"].as_array().unwrap().len(), 2);
}
