//! Client side of the cart and checkout flow.
//!
//! [`http::ApiClient`] speaks the REST surface. [`cart::CartClient`] keeps the
//! cart badge and cart page in sync through a single watch store,
//! [`auth_flow::AuthFlow`] folds the guest cart in after sign-in and
//! [`checkout::CheckoutSequencer`] walks the address and payment steps with
//! its snapshot kept in [`session::CheckoutSessionStore`].

pub mod auth_flow;
pub mod cart;
pub mod checkout;
pub mod http;
pub mod session;

pub use auth_flow::{AuthFlow, AuthGateway, AuthOutcome};
pub use cart::{
    CartClient, CartGateway, CartState, CartStore, Confirm, MutationOutcome, QuantityChange,
};
pub use checkout::{
    parse_payment_method, CheckoutError, CheckoutGateway, CheckoutSequencer, CheckoutStep, Redirect,
};
pub use http::{ApiClient, ClientConfig};
pub use session::{
    CheckoutCart, CheckoutLine, CheckoutSession, CheckoutSessionStore, MemorySessionStorage,
    SessionStorage, SnapshotError,
};

use thiserror::Error;

/// Errors surfaced by the HTTP client, classified by what the caller can do
/// about them.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    /// The request never produced a response (connection refused, timeout).
    #[error("Network error: {0}")]
    Network(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Stock or cart contents changed underneath the caller (409/422).
    #[error("Stock conflict: {0}")]
    StockConflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Failed to decode response: {0}")]
    Decode(String),

    #[error("Client configuration error: {0}")]
    Config(String),
}

impl ClientError {
    /// Whether retrying the same request later could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Network(_) => true,
            ClientError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ClientError::Decode(err.to_string())
        } else if err.is_builder() {
            ClientError::Config(err.to_string())
        } else {
            ClientError::Network(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(ClientError::Network("refused".into()).is_retryable());
        assert!(ClientError::Api {
            status: 503,
            message: "down".into()
        }
        .is_retryable());
        assert!(!ClientError::StockConflict("gone".into()).is_retryable());
        assert!(!ClientError::Unauthorized("nope".into()).is_retryable());
    }
}
