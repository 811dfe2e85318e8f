pub mod auth;
pub mod common;
pub mod commerce;
pub mod orders;

use crate::{
    auth::{AuthConfig, AuthService},
    config::AppConfig,
    db::DbPool,
    events::EventSender,
    services::{
        commerce::{CartService, PricingService, ProductService},
        orders::OrderService,
    },
};
use std::sync::Arc;

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

/// Services layer that encapsulates business logic used by HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub cart: Arc<CartService>,
    pub order: Arc<OrderService>,
    pub product: Arc<ProductService>,
    pub auth: Arc<AuthService>,
}

impl AppServices {
    /// Wires every service against one pool, one event channel and the
    /// configured pricing policy.
    pub fn new(db_pool: Arc<DbPool>, event_sender: Arc<EventSender>, config: &AppConfig) -> Self {
        let pricing = PricingService::new(config.pricing.clone());

        let cart = Arc::new(CartService::new(
            db_pool.clone(),
            event_sender.clone(),
            pricing.clone(),
        ));
        let order = Arc::new(OrderService::new(
            db_pool.clone(),
            event_sender.clone(),
            pricing,
        ));
        let product = Arc::new(ProductService::new(db_pool.clone(), event_sender.clone()));
        let auth = Arc::new(AuthService::new(
            AuthConfig::from(config),
            db_pool,
            event_sender,
        ));

        Self {
            cart,
            order,
            product,
            auth,
        }
    }
}
