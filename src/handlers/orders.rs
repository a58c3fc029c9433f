use crate::errors::ServiceError;
use crate::handlers::common::{created, ok, PaginatedResponse, PaginationParams};
use crate::services::orders::CreateOrderRequest;
use crate::AppState;
use axum::extract::{Path, Query, State};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use uuid::Uuid;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", post(create_order).get(list_orders))
        .route("/:id", get(get_order))
        .route("/:id/cancel", post(cancel_order))
}

async fn create_order(
    State(state): State<AppState>,
    Json(request): Json<CreateOrderRequest>,
) -> Result<Response, ServiceError> {
    let order = state.services.orders.create_from_cart(request).await?;
    Ok(created(order))
}

async fn get_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, ServiceError> {
    let order = state.services.orders.get_order(id).await?;
    Ok(ok(order))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListOrdersQuery {
    user_id: Uuid,
    #[serde(default = "PaginationParams::default_page")]
    page: u64,
    #[serde(default = "PaginationParams::default_per_page")]
    per_page: u64,
}

async fn list_orders(
    State(state): State<AppState>,
    Query(query): Query<ListOrdersQuery>,
) -> Result<Response, ServiceError> {
    let (orders, total) = state
        .services
        .orders
        .list_orders_for_user(query.user_id, query.page, query.per_page)
        .await?;

    Ok(ok(PaginatedResponse {
        items: orders,
        total,
        page: query.page,
        per_page: query.per_page,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelOrderRequest {
    user_id: Uuid,
}

async fn cancel_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<CancelOrderRequest>,
) -> Result<Response, ServiceError> {
    let order = state
        .services
        .orders
        .cancel_order(request.user_id, id)
        .await?;
    Ok(ok(order))
}
