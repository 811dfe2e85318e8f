//! Cart & checkout coordinator.
//!
//! The server half (`services`, `handlers`) owns carts, merges guest carts
//! into user carts and materializes orders. The `client` half drives the
//! cart badge and the three-step checkout against that server.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

// Core modules
pub mod auth;
pub mod client;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod health;
pub mod middleware_helpers;
pub mod migrator;
pub mod services;
pub mod tracing;

use axum::{routing::get, Router};
use sea_orm::DatabaseConnection;
use std::sync::Arc;
use std::time::Duration;
use tower_http::timeout::TimeoutLayer;

// App state definition
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: config::AppConfig,
    pub event_sender: Arc<events::EventSender>,
    pub services: handlers::AppServices,
}

impl AppState {
    pub fn new(
        db: Arc<DatabaseConnection>,
        config: config::AppConfig,
        event_sender: events::EventSender,
    ) -> Self {
        let event_sender = Arc::new(event_sender);
        let services = handlers::AppServices::new(db.clone(), event_sender.clone(), &config);
        Self {
            db,
            config,
            event_sender,
            services,
        }
    }
}

/// Cart, order, catalog and auth routes, mounted under `/api`.
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/status", get(api_status))
        .nest("/cart", handlers::commerce::carts_routes())
        .nest("/orders", handlers::orders::order_routes())
        .nest("/products", handlers::commerce::products_routes())
        .merge(handlers::auth::auth_router())
}

/// Full HTTP application: health probes, the API, request ids and tracing.
pub fn build_router(state: AppState) -> Router {
    let request_timeout = state.config.request_timeout_secs;

    let mut app = Router::new()
        .nest("/health", health::health_routes(state.db.clone()))
        .nest("/api", api_routes().with_state(state))
        .layer(tracing::configure_http_tracing());

    if request_timeout > 0 {
        app = app.layer(TimeoutLayer::new(Duration::from_secs(request_timeout)));
    }

    // Outermost so the trace span and error bodies see the id
    app.layer(axum::middleware::from_fn(
        middleware_helpers::request_id_middleware,
    ))
}

async fn api_status() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "ok",
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

pub mod prelude {
    pub use crate::auth::CartOwner;
    pub use crate::config::AppConfig;
    pub use crate::errors::*;
    pub use crate::services::commerce::{CartService, CartView, PricingService};
    pub use crate::services::orders::{OrderResponse, OrderService};
    pub use crate::{build_router, AppState};
}
