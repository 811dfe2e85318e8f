use crate::{
    auth::{bearer_token, AuthError},
    errors::{ApiError, ServiceError},
    handlers::common::{created_response, no_content_response, success_response, validate_input},
    AppState,
};
use axum::{
    extract::{Json, State},
    http::HeaderMap,
    response::IntoResponse,
    routing::post,
    Router,
};
use serde::{Deserialize, Serialize};
use tracing::info;
use validator::Validate;

/// Login request payload
#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct LoginRequest {
    #[validate(email)]
    pub email: String,
    #[validate(length(min = 1))]
    pub password: String,
}

/// Register request payload
#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct RegisterRequest {
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    #[validate(email)]
    pub email: String,
    #[validate(length(min = 8, message = "Password must be at least 8 characters"))]
    pub password: String,
}

pub fn auth_router() -> Router<AppState> {
    Router::new()
        .route("/login", post(login))
        .route("/register", post(register))
        .route("/logout", post(logout))
}

/// Login handler
pub async fn login(
    State(state): State<AppState>,
    Json(payload): Json<LoginRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validate_input(&payload)?;

    let token = state
        .services
        .auth
        .login(&payload.email, &payload.password)
        .await
        .map_err(ServiceError::from)?;

    info!(user_id = %token.user_id, "User logged in");
    Ok(success_response(token))
}

/// Register handler
pub async fn register(
    State(state): State<AppState>,
    Json(payload): Json<RegisterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validate_input(&payload)?;

    let token = state
        .services
        .auth
        .register(&payload.name, &payload.email, &payload.password)
        .await
        .map_err(ServiceError::from)?;

    Ok(created_response(token))
}

/// Revokes the presented bearer token
pub async fn logout(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let token = bearer_token(&headers).ok_or_else(|| ServiceError::from(AuthError::MissingAuth))?;

    state
        .services
        .auth
        .logout(token)
        .await
        .map_err(ServiceError::from)?;

    Ok(no_content_response())
}
