use super::ClientError;
use crate::{
    auth::{TokenResponse, GUEST_SESSION_HEADER},
    errors::ErrorResponse,
    handlers::{
        auth::{LoginRequest, RegisterRequest},
        commerce::carts::{AddItemRequest, MergeCartRequest, UpdateQuantityRequest},
    },
    services::{
        commerce::{CartView, MergeOutcome},
        orders::{CreateOrderRequest, OrderResponse},
    },
};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::{
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};
use tracing::{debug, instrument};
use uuid::Uuid;

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8080";

/// Connection settings for [`ApiClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server origin, without the `/api` prefix.
    pub base_url: String,
    /// How often [`super::CartClient::spawn_refresh`] polls the cart.
    pub refresh_interval: Duration,
    pub request_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            refresh_interval: Duration::from_secs(5),
            request_timeout: None,
        }
    }
}

#[derive(Debug, Default)]
struct Credentials {
    guest_token: Option<String>,
    bearer: Option<String>,
}

/// Thin REST client for the cart, order and auth endpoints.
///
/// Clones share credentials, so a login performed through one handle is seen
/// by every component holding another.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    credentials: Arc<RwLock<Credentials>>,
}

impl ApiClient {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let mut builder = Client::builder();
        if let Some(timeout) = config.request_timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| ClientError::Config(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            credentials: Arc::new(RwLock::new(Credentials::default())),
        })
    }

    /// Resumes an existing guest session.
    pub fn with_guest_session(self, token: impl Into<String>) -> Self {
        self.write_credentials(|c| c.guest_token = Some(token.into()));
        self
    }

    /// Starts a fresh guest session with a random token and returns it.
    pub fn new_guest_session(&self) -> String {
        let token = Uuid::new_v4().simple().to_string();
        let stored = token.clone();
        self.write_credentials(|c| c.guest_token = Some(stored));
        token
    }

    pub fn set_bearer(&self, token: Option<String>) {
        self.write_credentials(|c| c.bearer = token);
    }

    pub fn guest_token(&self) -> Option<String> {
        self.read_credentials(|c| c.guest_token.clone())
    }

    pub fn bearer(&self) -> Option<String> {
        self.read_credentials(|c| c.bearer.clone())
    }

    fn read_credentials<T>(&self, f: impl FnOnce(&Credentials) -> T) -> T {
        let guard = self.credentials.read().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    fn write_credentials(&self, f: impl FnOnce(&mut Credentials)) {
        let mut guard = self
            .credentials
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        f(&mut guard);
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api{}", self.base_url, path)
    }

    /// Attaches whichever identities the client currently holds.
    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let (guest, bearer) = self.read_credentials(|c| (c.guest_token.clone(), c.bearer.clone()));
        let request = match guest {
            Some(token) => request.header(GUEST_SESSION_HEADER, token),
            None => request,
        };
        match bearer {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ClientError> {
        let response = self.authorize(request).send().await?;
        parse_response(response).await
    }

    async fn send_empty(&self, request: RequestBuilder) -> Result<(), ClientError> {
        let response = self.authorize(request).send().await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(error_from_response(response).await)
        }
    }

    #[instrument(skip(self))]
    pub async fn get_cart(&self) -> Result<CartView, ClientError> {
        self.send(self.client.get(self.url("/cart"))).await
    }

    #[instrument(skip(self))]
    pub async fn add_item(&self, product_id: Uuid, quantity: i32) -> Result<CartView, ClientError> {
        let body = AddItemRequest {
            product_id,
            quantity,
        };
        self.send(self.client.post(self.url("/cart/items")).json(&body))
            .await
    }

    #[instrument(skip(self))]
    pub async fn update_item(&self, item_id: Uuid, quantity: i32) -> Result<CartView, ClientError> {
        let body = UpdateQuantityRequest { quantity };
        self.send(
            self.client
                .put(self.url(&format!("/cart/items/{}", item_id)))
                .json(&body),
        )
        .await
    }

    #[instrument(skip(self))]
    pub async fn remove_item(&self, item_id: Uuid) -> Result<CartView, ClientError> {
        self.send(
            self.client
                .delete(self.url(&format!("/cart/items/{}", item_id))),
        )
        .await
    }

    #[instrument(skip(self))]
    pub async fn clear_cart(&self, cart_id: Uuid) -> Result<CartView, ClientError> {
        self.send(self.client.delete(self.url(&format!("/cart/{}", cart_id))))
            .await
    }

    /// Folds the given guest cart into the signed-in user's cart.
    #[instrument(skip_all)]
    pub async fn merge_guest_cart(&self, guest_token: &str) -> Result<MergeOutcome, ClientError> {
        let body = MergeCartRequest {
            guest_session_id: guest_token.to_string(),
        };
        self.send(self.client.post(self.url("/cart/merge")).json(&body))
            .await
    }

    #[instrument(skip_all, fields(cart_id = %request.cart_id))]
    pub async fn create_order(
        &self,
        request: &CreateOrderRequest,
    ) -> Result<OrderResponse, ClientError> {
        self.send(self.client.post(self.url("/orders")).json(request))
            .await
    }

    #[instrument(skip(self))]
    pub async fn get_order(&self, order_id: Uuid) -> Result<OrderResponse, ClientError> {
        self.send(self.client.get(self.url(&format!("/orders/{}", order_id))))
            .await
    }

    /// Logs in and keeps the issued token for subsequent requests.
    #[instrument(skip(self, password))]
    pub async fn login(&self, email: &str, password: &str) -> Result<TokenResponse, ClientError> {
        let body = LoginRequest {
            email: email.to_string(),
            password: password.to_string(),
        };
        let token: TokenResponse = self
            .send(self.client.post(self.url("/login")).json(&body))
            .await?;
        self.set_bearer(Some(token.access_token.clone()));
        debug!(user_id = %token.user_id, "logged in");
        Ok(token)
    }

    #[instrument(skip(self, password))]
    pub async fn register(
        &self,
        name: &str,
        email: &str,
        password: &str,
    ) -> Result<TokenResponse, ClientError> {
        let body = RegisterRequest {
            name: name.to_string(),
            email: email.to_string(),
            password: password.to_string(),
        };
        let token: TokenResponse = self
            .send(self.client.post(self.url("/register")).json(&body))
            .await?;
        self.set_bearer(Some(token.access_token.clone()));
        Ok(token)
    }

    /// Revokes the current token server-side and forgets it locally.
    #[instrument(skip(self))]
    pub async fn logout(&self) -> Result<(), ClientError> {
        let result = self.send_empty(self.client.post(self.url("/logout"))).await;
        self.set_bearer(None);
        result
    }
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

async fn parse_response<T: DeserializeOwned>(response: Response) -> Result<T, ClientError> {
    if !response.status().is_success() {
        return Err(error_from_response(response).await);
    }
    response
        .json::<T>()
        .await
        .map_err(|e| ClientError::Decode(e.to_string()))
}

/// Turns a non-2xx response into a [`ClientError`], preferring the server's
/// JSON error message over the raw body.
async fn error_from_response(response: Response) -> ClientError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorResponse>(&body)
        .map(|e| e.message)
        .unwrap_or(body);
    classify(status, message)
}

fn classify(status: StatusCode, message: String) -> ClientError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ClientError::Unauthorized(message),
        StatusCode::NOT_FOUND => ClientError::NotFound(message),
        StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY => {
            ClientError::StockConflict(message)
        }
        StatusCode::BAD_REQUEST => ClientError::Validation(message),
        other => ClientError::Api {
            status: other.as_u16(),
            message,
        },
    }
}

#[async_trait::async_trait]
impl super::CartGateway for ApiClient {
    async fn get_cart(&self) -> Result<CartView, ClientError> {
        ApiClient::get_cart(self).await
    }

    async fn add_item(&self, product_id: Uuid, quantity: i32) -> Result<CartView, ClientError> {
        ApiClient::add_item(self, product_id, quantity).await
    }

    async fn update_item(&self, item_id: Uuid, quantity: i32) -> Result<CartView, ClientError> {
        ApiClient::update_item(self, item_id, quantity).await
    }

    async fn remove_item(&self, item_id: Uuid) -> Result<CartView, ClientError> {
        ApiClient::remove_item(self, item_id).await
    }

    async fn clear_cart(&self, cart_id: Uuid) -> Result<CartView, ClientError> {
        ApiClient::clear_cart(self, cart_id).await
    }
}

#[async_trait::async_trait]
impl super::AuthGateway for ApiClient {
    fn guest_token(&self) -> Option<String> {
        ApiClient::guest_token(self)
    }

    async fn login(&self, email: &str, password: &str) -> Result<TokenResponse, ClientError> {
        ApiClient::login(self, email, password).await
    }

    async fn register(
        &self,
        name: &str,
        email: &str,
        password: &str,
    ) -> Result<TokenResponse, ClientError> {
        ApiClient::register(self, name, email, password).await
    }

    async fn merge_guest_cart(&self, guest_token: &str) -> Result<MergeOutcome, ClientError> {
        ApiClient::merge_guest_cart(self, guest_token).await
    }
}

#[async_trait::async_trait]
impl super::CheckoutGateway for ApiClient {
    async fn create_order(
        &self,
        request: &CreateOrderRequest,
    ) -> Result<OrderResponse, ClientError> {
        ApiClient::create_order(self, request).await
    }

    async fn clear_cart(&self, cart_id: Uuid) -> Result<CartView, ClientError> {
        ApiClient::clear_cart(self, cart_id).await
    }

    async fn get_order(&self, order_id: Uuid) -> Result<OrderResponse, ClientError> {
        ApiClient::get_order(self, order_id).await
    }
}
