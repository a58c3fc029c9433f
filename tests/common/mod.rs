#![allow(dead_code)]

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use pharmacy_api::config::{AppConfig, MpesaConfig};
use pharmacy_api::entities::product;
use pharmacy_api::events::event_channel;
use pharmacy_api::{app_router, db, AppState};
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, Set};
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;
use uuid::Uuid;

/// Spins up the full application over a throwaway SQLite file and drives it
/// with in-process requests.
pub struct TestApp {
    pub router: Router,
    pub db: Arc<sea_orm::DatabaseConnection>,
    // Keeps the SQLite file alive for the test's duration
    _tmp: TempDir,
}

impl TestApp {
    pub async fn spawn() -> Self {
        Self::spawn_with_mpesa(MpesaConfig::default()).await
    }

    /// Harness with a custom gateway config, e.g. pointing at a wiremock
    /// server.
    pub async fn spawn_with_mpesa(mpesa: MpesaConfig) -> Self {
        let tmp = TempDir::new().expect("create temp dir");
        let db_path = tmp.path().join("test.db");
        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());

        let pool = db::establish_connection(&db_url)
            .await
            .expect("connect test database");
        db::run_migrations(&pool).await.expect("run migrations");

        let mut config = AppConfig::new(
            db_url,
            "127.0.0.1".to_string(),
            0,
            "development".to_string(),
        );
        config.mpesa = mpesa;

        let (event_sender, event_receiver) = event_channel(config.event_channel_capacity);
        tokio::spawn(pharmacy_api::events::process_events(event_receiver));

        let db = Arc::new(pool);
        let state = AppState::new(Arc::clone(&db), Arc::new(config), event_sender)
            .expect("build app state");

        Self {
            router: app_router(state),
            db,
            _tmp: tmp,
        }
    }

    pub async fn post_json(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method("POST")
            .uri(path)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .expect("build request");

        self.send(request).await
    }

    pub async fn get(&self, path: &str) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method("GET")
            .uri(path)
            .body(Body::empty())
            .expect("build request");

        self.send(request).await
    }

    pub async fn delete(&self, path: &str) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method("DELETE")
            .uri(path)
            .body(Body::empty())
            .expect("build request");

        self.send(request).await
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("dispatch request");

        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("read body");
        let value = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
        };

        (status, value)
    }

    /// Seeds a product directly into the catalog.
    pub async fn seed_product(&self, name: &str, unit_price: Decimal, stock: i32) -> Uuid {
        let id = Uuid::new_v4();
        product::ActiveModel {
            id: Set(id),
            sku: Set(format!("SKU-{}", id.simple())),
            name: Set(name.to_string()),
            description: Set(None),
            unit_price: Set(unit_price),
            stock_on_hand: Set(stock),
            is_active: Set(true),
            ..Default::default()
        }
        .insert(&*self.db)
        .await
        .expect("seed product");
        id
    }

    /// Cart + order in one go; returns the order JSON from the API.
    pub async fn place_order(
        &self,
        user_id: Uuid,
        product_id: Uuid,
        quantity: i32,
    ) -> serde_json::Value {
        let (status, _) = self
            .post_json(
                "/api/v1/cart/items",
                serde_json::json!({
                    "userId": user_id,
                    "productId": product_id,
                    "quantity": quantity,
                }),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "cart add failed");

        let (status, body) = self
            .post_json("/api/v1/orders", serde_json::json!({ "userId": user_id }))
            .await;
        assert_eq!(status, StatusCode::CREATED, "order create failed: {body}");
        body["data"].clone()
    }
}

/// Default sandbox gateway config with a simulated-push escape hatch, for
/// flows that never reach a real provider.
pub fn simulated_mpesa_config() -> MpesaConfig {
    MpesaConfig {
        consumer_key: "test-key".to_string(),
        consumer_secret: "test-secret".to_string(),
        shortcode: "174379".to_string(),
        passkey: "test-passkey".to_string(),
        callback_url: "https://example.invalid/api/v1/mpesa/callback".to_string(),
        // Unroutable base URL: the token fetch fails fast and the simulated
        // fallback takes over
        api_base_url: "http://127.0.0.1:1".to_string(),
        environment: "sandbox".to_string(),
        timeout_secs: 1,
        token_retry_attempts: 1,
        token_retry_base_delay_ms: 10,
        allow_simulated_push: true,
    }
}

/// Gateway config pointed at a wiremock server.
pub fn wiremock_mpesa_config(base_url: &str) -> MpesaConfig {
    MpesaConfig {
        consumer_key: "test-key".to_string(),
        consumer_secret: "test-secret".to_string(),
        shortcode: "174379".to_string(),
        passkey: "test-passkey".to_string(),
        callback_url: "https://example.invalid/api/v1/mpesa/callback".to_string(),
        api_base_url: base_url.to_string(),
        environment: "sandbox".to_string(),
        timeout_secs: 5,
        token_retry_attempts: 3,
        token_retry_base_delay_ms: 10,
        allow_simulated_push: false,
    }
}
