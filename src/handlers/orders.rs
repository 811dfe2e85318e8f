use axum::{
    extract::{Path, State},
    response::IntoResponse,
    routing::{get, patch},
    Json, Router,
};
use uuid::Uuid;

use crate::handlers::common::{created_response, map_service_error, success_response};
use crate::{
    auth::CartOwner,
    errors::ApiError,
    services::orders::{CreateOrderRequest, UpdateOrderStatusRequest},
    AppState,
};

/// Creates the router for order endpoints
pub fn order_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_orders).post(create_order))
        .route("/:id", get(get_order))
        .route("/:id/status", patch(update_order_status))
}

/// Materialize an order from the caller's frozen cart
async fn create_order(
    State(state): State<AppState>,
    owner: CartOwner,
    Json(payload): Json<CreateOrderRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let order = state
        .services
        .order
        .create_order(&owner, payload)
        .await
        .map_err(map_service_error)?;

    Ok(created_response(order))
}

async fn list_orders(
    State(state): State<AppState>,
    owner: CartOwner,
) -> Result<impl IntoResponse, ApiError> {
    let orders = state
        .services
        .order
        .list_orders(&owner)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(orders))
}

async fn get_order(
    State(state): State<AppState>,
    owner: CartOwner,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let order = state
        .services
        .order
        .get_order(&owner, id)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(order))
}

/// Owners may only cancel; fulfillment transitions are not routed.
async fn update_order_status(
    State(state): State<AppState>,
    owner: CartOwner,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateOrderStatusRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let order = state
        .services
        .order
        .update_status(&owner, id, payload.status)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(order))
}
