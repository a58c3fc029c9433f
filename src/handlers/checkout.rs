use crate::errors::ServiceError;
use crate::handlers::common::{created, ok, PaginatedResponse, PaginationParams};
use crate::services::checkout::CreateCheckoutRequest;
use crate::AppState;
use axum::extract::{Path, Query, State};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use uuid::Uuid;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/new", post(create_checkout))
        .route("/", get(list_checkouts))
        .route("/:id", get(get_checkout))
}

async fn create_checkout(
    State(state): State<AppState>,
    Json(request): Json<CreateCheckoutRequest>,
) -> Result<Response, ServiceError> {
    let checkout = state.services.checkout.create_intent(request).await?;
    Ok(created(checkout))
}

async fn get_checkout(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, ServiceError> {
    let checkout = state.services.checkout.get_checkout(id).await?;
    Ok(ok(checkout))
}

async fn list_checkouts(
    State(state): State<AppState>,
    Query(pagination): Query<PaginationParams>,
) -> Result<Response, ServiceError> {
    let (checkouts, total) = state
        .services
        .checkout
        .list_checkouts(pagination.page, pagination.per_page)
        .await?;

    Ok(ok(PaginatedResponse {
        items: checkouts,
        total,
        page: pagination.page,
        per_page: pagination.per_page,
    }))
}
