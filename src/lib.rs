pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod migrator;
pub mod services;

use crate::config::AppConfig;
use crate::errors::ServiceError;
use crate::events::EventSender;
use crate::handlers::AppServices;
use crate::services::cart::CartService;
use crate::services::checkout::CheckoutService;
use crate::services::mpesa::gateway::MpesaGateway;
use crate::services::mpesa::reconciliation::ReconciliationService;
use crate::services::mpesa::MpesaService;
use crate::services::orders::OrderService;
use axum::extract::State;
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use rust_decimal::Decimal;
use sea_orm::DatabaseConnection;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

/// Upper bound on any single request, gateway calls included
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared application state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: Arc<AppConfig>,
    pub event_sender: EventSender,
    pub services: AppServices,
}

impl AppState {
    pub fn new(
        db: Arc<DatabaseConnection>,
        config: Arc<AppConfig>,
        event_sender: EventSender,
    ) -> Result<Self, ServiceError> {
        let services = build_services(&db, &config, &event_sender)?;
        Ok(Self {
            db,
            config,
            event_sender,
            services,
        })
    }
}

/// Wires the service layer from config and shared infrastructure.
pub fn build_services(
    db: &Arc<DatabaseConnection>,
    config: &AppConfig,
    event_sender: &EventSender,
) -> Result<AppServices, ServiceError> {
    let delivery_fee = Decimal::from_f64_retain(config.default_delivery_fee)
        .unwrap_or(Decimal::ZERO);

    let gateway = Arc::new(MpesaGateway::new(config.mpesa.clone())?);

    Ok(AppServices {
        orders: OrderService::new(Arc::clone(db), event_sender.clone(), delivery_fee),
        cart: CartService::new(Arc::clone(db)),
        checkout: CheckoutService::new(Arc::clone(db), event_sender.clone()),
        mpesa: MpesaService::new(
            Arc::clone(db),
            config.mpesa.clone(),
            gateway,
            event_sender.clone(),
        ),
        reconciliation: ReconciliationService::new(Arc::clone(db), event_sender.clone()),
    })
}

/// All versioned API routes
pub fn api_v1_routes() -> Router<AppState> {
    Router::new()
        .route("/status", get(status))
        .nest("/orders", handlers::orders::routes())
        .nest("/cart", handlers::carts::routes())
        .nest("/checkout", handlers::checkout::routes())
        .nest("/mpesa", handlers::mpesa::routes())
}

/// Full application router with middleware layers
pub fn app_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config);

    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", api_v1_routes())
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(CompressionLayer::new())
        .layer(cors)
        .with_state(state)
}

fn cors_layer(config: &AppConfig) -> CorsLayer {
    if config.should_allow_permissive_cors() {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST, Method::DELETE])
            .allow_headers([header::CONTENT_TYPE]);
    }

    let origins: Vec<HeaderValue> = config
        .cors_allowed_origins
        .as_deref()
        .unwrap_or("")
        .split(',')
        .filter_map(|origin| {
            let origin = origin.trim();
            if origin.is_empty() {
                return None;
            }
            match HeaderValue::from_str(origin) {
                Ok(v) => Some(v),
                Err(e) => {
                    warn!("Skipping invalid CORS origin {:?}: {}", origin, e);
                    None
                }
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE])
}

async fn status(State(state): State<AppState>) -> Response {
    Json(json!({
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "environment": state.config.environment,
    }))
    .into_response()
}

async fn health(State(state): State<AppState>) -> Response {
    match db::check_connection(&state.db).await {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "ok" }))).into_response(),
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "degraded", "database": "unreachable" })),
        )
            .into_response(),
    }
}
