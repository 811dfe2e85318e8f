#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::{self, Body},
    http::{Method, Request, StatusCode},
    response::Response,
    Router,
};
use cartflow_api::{
    auth::GUEST_SESSION_HEADER,
    build_router,
    config::AppConfig,
    db,
    entities::product,
    events,
    services::commerce::CreateProductInput,
    AppState,
};
use rust_decimal::Decimal;
use serde_json::Value;
use tokio::net::TcpListener;
use tower::ServiceExt;
use uuid::Uuid;

/// Who a request is made as.
#[derive(Clone, Copy)]
pub enum As<'a> {
    Anonymous,
    Guest(&'a str),
    User(&'a str),
}

/// Application backed by a fresh in-memory SQLite database.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    pub async fn new() -> Self {
        let cfg = AppConfig::new(
            "sqlite::memory:".to_string(),
            "integration_test_secret_key_with_32_plus_chars".to_string(),
            "127.0.0.1".to_string(),
            0,
            "test".to_string(),
        );

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");

        let (event_sender, event_rx) = events::channel(256);
        let event_task = tokio::spawn(events::process_events(event_rx));

        let state = AppState::new(Arc::new(pool), cfg, event_sender);
        let router = build_router(state.clone());

        Self {
            router,
            state,
            _event_task: event_task,
        }
    }

    /// Serves the app on an ephemeral port and returns its base URL.
    pub async fn spawn_server(&self) -> String {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let addr: SocketAddr = listener.local_addr().expect("listener address");
        let router = self.router.clone();
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("test server");
        });
        format!("http://{}", addr)
    }

    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        who: As<'_>,
    ) -> Response {
        let mut builder = Request::builder().method(method).uri(path);
        builder = match who {
            As::Anonymous => builder,
            As::Guest(token) => builder.header(GUEST_SESSION_HEADER, token),
            As::User(jwt) => builder.header("authorization", format!("Bearer {}", jwt)),
        };
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string())),
            None => builder.body(Body::empty()),
        }
        .expect("valid request");

        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router response")
    }

    /// Sends the request and decodes the JSON body, asserting the status.
    pub async fn json(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        who: As<'_>,
        expected: StatusCode,
    ) -> Value {
        let response = self.request(method, path, body, who).await;
        let status = response.status();
        let json = body_json(response).await;
        assert_eq!(status, expected, "unexpected status, body: {}", json);
        json
    }

    pub async fn seed_product(&self, sku: &str, price: Decimal, stock: i32) -> product::Model {
        self.state
            .services
            .product
            .create_product(CreateProductInput {
                sku: sku.to_string(),
                name: format!("Product {}", sku),
                description: None,
                price,
                stock,
            })
            .await
            .expect("seed product")
    }

    pub async fn product_stock(&self, id: Uuid) -> i32 {
        self.state
            .services
            .product
            .get_product(id)
            .await
            .expect("product exists")
            .stock
    }

    /// Registers a user and returns the bearer token.
    pub async fn register_user(&self, email: &str) -> String {
        self.state
            .services
            .auth
            .register("Test User", email, "correct-horse-battery")
            .await
            .expect("register user")
            .access_token
    }
}

pub async fn body_json(response: Response) -> Value {
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body bytes");
    if bytes.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(&bytes).expect("json response")
}

/// Reads a decimal that may be serialized as a string or a number.
pub fn money(value: &Value) -> Decimal {
    match value {
        Value::String(s) => s.parse().expect("decimal string"),
        Value::Number(n) => n.to_string().parse().expect("decimal number"),
        other => panic!("not a decimal: {}", other),
    }
}

pub fn guest_token() -> String {
    Uuid::new_v4().simple().to_string()
}
