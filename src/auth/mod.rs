//! Bearer-token authentication and cart ownership.
//!
//! A request owns a cart either as an authenticated user (`Authorization:
//! Bearer <jwt>`) or as a guest (`x-guest-session: <token>`). The bearer
//! token wins when both are present.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header, request::Parts, HeaderMap},
};
use chrono::{Duration as ChronoDuration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use sea_orm::{ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::{
    config::AppConfig,
    entities::user_entity::{self, Entity as User},
    errors::ServiceError,
    events::{Event, EventSender},
    AppState,
};

/// Header carrying the guest session token.
pub const GUEST_SESSION_HEADER: &str = "x-guest-session";

const MAX_GUEST_TOKEN_LEN: usize = 128;

/// Claim structure for JWT tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String, // user id
    pub email: String,
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Clone, Debug)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub access_token_expiration: Duration,
}

impl AuthConfig {
    pub fn new(jwt_secret: String, access_token_expiration: Duration) -> Self {
        Self {
            jwt_secret,
            access_token_expiration,
        }
    }
}

impl From<&AppConfig> for AuthConfig {
    fn from(cfg: &AppConfig) -> Self {
        Self::new(
            cfg.jwt_secret.clone(),
            Duration::from_secs(cfg.jwt_expiration as u64),
        )
    }
}

/// Issued on login and registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: i64,
    pub user_id: Uuid,
    pub name: String,
    pub email: String,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Missing authentication")]
    MissingAuth,

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Invalid token")]
    InvalidToken,

    #[error("Token has expired")]
    TokenExpired,

    #[error("Token has been revoked")]
    RevokedToken,

    #[error("Email already registered")]
    EmailTaken,

    #[error("Token creation failed: {0}")]
    TokenCreation(String),

    #[error("Password hashing failed: {0}")]
    Hash(String),

    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),
}

impl From<AuthError> for ServiceError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::EmailTaken => ServiceError::Conflict(err.to_string()),
            AuthError::TokenCreation(msg) => ServiceError::JwtError(msg),
            AuthError::Hash(msg) => ServiceError::HashError(msg),
            AuthError::Database(db) => ServiceError::DatabaseError(db),
            other => ServiceError::Unauthorized(other.to_string()),
        }
    }
}

/// Issues and validates tokens, and owns the user accounts table.
#[derive(Debug, Clone)]
pub struct AuthService {
    config: AuthConfig,
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    /// Revoked token ids mapped to the token's own expiry.
    revoked_tokens: Arc<RwLock<HashMap<String, i64>>>,
}

impl AuthService {
    pub fn new(
        config: AuthConfig,
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
    ) -> Self {
        Self {
            config,
            db,
            event_sender,
            revoked_tokens: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    #[instrument(skip(self, password))]
    pub async fn register(
        &self,
        name: &str,
        email: &str,
        password: &str,
    ) -> Result<TokenResponse, AuthError> {
        let email = email.trim().to_lowercase();
        let existing = User::find()
            .filter(user_entity::Column::Email.eq(email.clone()))
            .one(&*self.db)
            .await?;
        if existing.is_some() {
            return Err(AuthError::EmailTaken);
        }

        let now = Utc::now();
        let user = user_entity::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(name.trim().to_string()),
            email: Set(email),
            password_hash: Set(hash_password(password)?),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.db)
        .await?;

        info!(user_id = %user.id, "user registered");
        self.event_sender
            .send_or_log(Event::UserRegistered(user.id))
            .await;

        self.generate_token(&user)
    }

    #[instrument(skip(self, password))]
    pub async fn login(&self, email: &str, password: &str) -> Result<TokenResponse, AuthError> {
        let email = email.trim().to_lowercase();
        let user = User::find()
            .filter(user_entity::Column::Email.eq(email))
            .one(&*self.db)
            .await?
            .ok_or(AuthError::InvalidCredentials)?;

        if !verify_password(password, &user.password_hash) {
            warn!(user_id = %user.id, "login rejected");
            return Err(AuthError::InvalidCredentials);
        }

        self.generate_token(&user)
    }

    /// Revokes the token's id; later validation fails with `RevokedToken`.
    pub async fn logout(&self, token: &str) -> Result<(), AuthError> {
        let claims = self.validate_token(token).await?;
        self.revoke(claims.jti, claims.exp).await;
        Ok(())
    }

    /// Entries whose token could no longer validate anyway are dropped on
    /// every insert, so the list only holds live tokens.
    async fn revoke(&self, jti: String, exp: i64) {
        let cutoff = Utc::now().timestamp() - token_validation().leeway as i64;
        let mut revoked = self.revoked_tokens.write().await;
        revoked.retain(|_, expires_at| *expires_at >= cutoff);
        revoked.insert(jti, exp);
    }

    pub fn generate_token(&self, user: &user_entity::Model) -> Result<TokenResponse, AuthError> {
        let now = Utc::now();
        let exp = now
            + ChronoDuration::from_std(self.config.access_token_expiration)
                .map_err(|_| AuthError::TokenCreation("invalid token duration".to_string()))?;

        let claims = Claims {
            sub: user.id.to_string(),
            email: user.email.clone(),
            jti: Uuid::new_v4().to_string(),
            iat: now.timestamp(),
            exp: exp.timestamp(),
        };

        let access_token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.config.jwt_secret.as_bytes()),
        )
        .map_err(|e| AuthError::TokenCreation(e.to_string()))?;

        Ok(TokenResponse {
            access_token,
            token_type: "Bearer".to_string(),
            expires_in: self.config.access_token_expiration.as_secs() as i64,
            user_id: user.id,
            name: user.name.clone(),
            email: user.email.clone(),
        })
    }

    pub async fn validate_token(&self, token: &str) -> Result<Claims, AuthError> {
        let claims = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.config.jwt_secret.as_bytes()),
            &token_validation(),
        )
        .map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
            _ => AuthError::InvalidToken,
        })?
        .claims;

        if self.revoked_tokens.read().await.contains_key(&claims.jti) {
            return Err(AuthError::RevokedToken);
        }

        Ok(claims)
    }

    /// Resolves a bearer token to its user id.
    pub async fn user_id_from_token(&self, token: &str) -> Result<Uuid, AuthError> {
        let claims = self.validate_token(token).await?;
        Uuid::parse_str(&claims.sub).map_err(|_| AuthError::InvalidToken)
    }
}

fn token_validation() -> Validation {
    Validation::new(Algorithm::HS256)
}

pub fn hash_password(password: &str) -> Result<String, AuthError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AuthError::Hash(e.to_string()))
}

pub fn verify_password(password: &str, stored_hash: &str) -> bool {
    PasswordHash::new(stored_hash)
        .map(|parsed| {
            Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok()
        })
        .unwrap_or(false)
}

/// The owner key of a cart. Neither `Debug` nor `Display` print the guest
/// token, so owners can be recorded in spans.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum CartOwner {
    User(Uuid),
    Guest(String),
}

impl CartOwner {
    pub fn user_id(&self) -> Option<Uuid> {
        match self {
            CartOwner::User(id) => Some(*id),
            CartOwner::Guest(_) => None,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            CartOwner::User(_) => None,
            CartOwner::Guest(token) => Some(token),
        }
    }
}

impl std::fmt::Display for CartOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CartOwner::User(id) => write!(f, "user:{}", id),
            CartOwner::Guest(_) => write!(f, "guest"),
        }
    }
}

impl std::fmt::Debug for CartOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CartOwner::User(id) => f.debug_tuple("User").field(id).finish(),
            CartOwner::Guest(_) => f.debug_tuple("Guest").field(&"<redacted>").finish(),
        }
    }
}

pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

fn guest_token(parts: &Parts) -> Option<String> {
    parts
        .headers
        .get(GUEST_SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|t| !t.is_empty() && t.len() <= MAX_GUEST_TOKEN_LEN)
        .map(str::to_string)
}

#[async_trait]
impl FromRequestParts<AppState> for CartOwner {
    type Rejection = ServiceError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        if let Some(token) = bearer_token(&parts.headers) {
            let user_id = state.services.auth.user_id_from_token(token).await?;
            return Ok(CartOwner::User(user_id));
        }

        guest_token(parts)
            .map(CartOwner::Guest)
            .ok_or_else(|| AuthError::MissingAuth.into())
    }
}

/// Extractor for routes that require a signed-in user.
#[derive(Debug, Clone, Copy)]
pub struct AuthenticatedUser(pub Uuid);

#[async_trait]
impl FromRequestParts<AppState> for AuthenticatedUser {
    type Rejection = ServiceError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers).ok_or(AuthError::MissingAuth)?;
        let user_id = state.services.auth.user_id_from_token(token).await?;
        Ok(AuthenticatedUser(user_id))
    }
}
