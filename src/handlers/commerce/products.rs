use crate::handlers::common::{map_service_error, success_response};
use crate::{errors::ApiError, services::commerce::ProductSearchQuery, AppState};
use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    routing::get,
    Router,
};
use uuid::Uuid;

/// Creates the router for product endpoints
pub fn products_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_products))
        .route("/:id", get(get_product))
}

/// Search products
async fn list_products(
    State(state): State<AppState>,
    Query(query): Query<ProductSearchQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let result = state
        .services
        .product
        .search_products(query)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(result))
}

/// Get product by ID
async fn get_product(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let product = state
        .services
        .product
        .get_product(id)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(product))
}
