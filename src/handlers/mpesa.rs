use crate::errors::ServiceError;
use crate::handlers::common::ok;
use crate::services::mpesa::types::CallbackEnvelope;
use crate::services::mpesa::InitiatePushRequest;
use crate::AppState;
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tracing::warn;
use uuid::Uuid;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/stkpush", post(stk_push))
        .route("/callback", post(callback))
        .route("/verify/:checkout_id", get(verify))
}

async fn stk_push(
    State(state): State<AppState>,
    Json(request): Json<InitiatePushRequest>,
) -> Result<Response, ServiceError> {
    let checkout = state.services.mpesa.initiate_push(request).await?;
    Ok(ok(checkout))
}

/// Provider webhook. Unauthenticated by protocol; correlation is by
/// CheckoutRequestID only.
///
/// The body is taken as raw JSON first so a malformed payload maps to 400
/// while business failures (declined payments) still acknowledge with 200.
async fn callback(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> Result<Response, ServiceError> {
    let envelope: CallbackEnvelope = serde_json::from_value(payload).map_err(|e| {
        warn!("Malformed M-Pesa callback payload: {}", e);
        ServiceError::InvalidInput("Malformed callback payload".to_string())
    })?;

    let outcome = state
        .services
        .reconciliation
        .process_callback(envelope.body.stk_callback)
        .await?;

    // Bare acknowledgement body; the provider is the consumer, not our
    // API clients, so no response envelope.
    Ok(Json(json!({ "message": outcome.message() })).into_response())
}

async fn verify(
    State(state): State<AppState>,
    Path(checkout_id): Path<Uuid>,
) -> Result<Response, ServiceError> {
    let status = state.services.mpesa.verify_transaction(checkout_id).await?;
    Ok(ok(status))
}
