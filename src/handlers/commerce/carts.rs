use crate::handlers::common::{map_service_error, success_response, validate_input};
use crate::{
    auth::{AuthenticatedUser, CartOwner},
    errors::ApiError,
    services::commerce::cart_service::AddToCartInput,
    AppState,
};
use axum::{
    extract::{Json, Path, State},
    response::IntoResponse,
    routing::{delete, get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// Creates the router for cart endpoints
pub fn carts_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(get_cart))
        .route("/count", get(cart_count))
        .route("/items", post(add_to_cart))
        .route("/items/:id", put(update_cart_item).delete(remove_cart_item))
        .route("/merge", post(merge_guest_cart))
        .route("/:cart_id", delete(clear_cart))
}

/// Get the caller's cart. Callers without any identity get the empty cart.
async fn get_cart(
    State(state): State<AppState>,
    owner: Option<CartOwner>,
) -> Result<impl IntoResponse, ApiError> {
    let view = match owner {
        Some(owner) => state
            .services
            .cart
            .get_cart(&owner)
            .await
            .map_err(map_service_error)?,
        None => state.services.cart.empty_view(),
    };

    Ok(success_response(view))
}

async fn cart_count(
    State(state): State<AppState>,
    owner: Option<CartOwner>,
) -> Result<impl IntoResponse, ApiError> {
    let count = match owner {
        Some(owner) => state
            .services
            .cart
            .item_count(&owner)
            .await
            .map_err(map_service_error)?,
        None => 0,
    };

    Ok(success_response(CartCountResponse { count }))
}

/// Add item to cart
async fn add_to_cart(
    State(state): State<AppState>,
    owner: CartOwner,
    Json(payload): Json<AddItemRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validate_input(&payload)?;

    let input = AddToCartInput {
        product_id: payload.product_id,
        quantity: payload.quantity,
    };

    let cart = state
        .services
        .cart
        .add_item(&owner, input)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(cart))
}

/// Update cart item quantity
async fn update_cart_item(
    State(state): State<AppState>,
    owner: CartOwner,
    Path(item_id): Path<Uuid>,
    Json(payload): Json<UpdateQuantityRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validate_input(&payload)?;

    let cart = state
        .services
        .cart
        .update_item_quantity(&owner, item_id, payload.quantity)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(cart))
}

/// Remove item from cart
async fn remove_cart_item(
    State(state): State<AppState>,
    owner: CartOwner,
    Path(item_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let cart = state
        .services
        .cart
        .remove_item(&owner, item_id)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(cart))
}

/// Clear all items from cart
async fn clear_cart(
    State(state): State<AppState>,
    owner: CartOwner,
    Path(cart_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let cart = state
        .services
        .cart
        .clear_cart(&owner, cart_id)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(cart))
}

/// Fold a guest cart into the signed-in user's cart
async fn merge_guest_cart(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Json(payload): Json<MergeCartRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validate_input(&payload)?;

    let outcome = state
        .services
        .cart
        .merge_guest_cart(user_id, payload.guest_session_id.trim())
        .await
        .map_err(map_service_error)?;

    Ok(success_response(outcome))
}

// Request DTOs

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct AddItemRequest {
    pub product_id: Uuid,
    #[serde(default = "default_quantity")]
    #[validate(range(min = 1, message = "Quantity must be at least 1"))]
    pub quantity: i32,
}

fn default_quantity() -> i32 {
    1
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct UpdateQuantityRequest {
    #[validate(range(min = 1, message = "Quantity must be at least 1"))]
    pub quantity: i32,
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct MergeCartRequest {
    #[validate(length(min = 1, max = 128))]
    pub guest_session_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CartCountResponse {
    pub count: i64,
}
