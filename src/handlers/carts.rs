use crate::errors::ServiceError;
use crate::handlers::common::ok;
use crate::services::cart::AddCartItemRequest;
use crate::AppState;
use axum::extract::{Path, State};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use uuid::Uuid;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/items", post(add_item))
        .route("/:user_id", get(get_cart).delete(clear_cart))
}

async fn add_item(
    State(state): State<AppState>,
    Json(request): Json<AddCartItemRequest>,
) -> Result<Response, ServiceError> {
    let cart = state.services.cart.add_item(request).await?;
    Ok(ok(cart))
}

async fn get_cart(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<Response, ServiceError> {
    let cart = state.services.cart.get_cart(user_id).await?;
    Ok(ok(cart))
}

async fn clear_cart(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<Response, ServiceError> {
    let removed = state.services.cart.clear_cart(user_id).await?;
    Ok(ok(json!({ "removed": removed })))
}
