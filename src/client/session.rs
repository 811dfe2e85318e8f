//! Tab-scoped key/value storage and the typed checkout snapshot kept in it.

use crate::services::{commerce::CartView, orders::ShippingAddress};
use rust_decimal::Decimal;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;
use validator::Validate;

pub const CHECKOUT_ADDRESS_KEY: &str = "checkoutAddress";
pub const CHECKOUT_CART_KEY: &str = "checkoutCart";
pub const LAST_ORDER_ID_KEY: &str = "lastOrderId";

/// String storage with browser session-storage semantics.
pub trait SessionStorage: Send + Sync {
    fn get_item(&self, key: &str) -> Option<String>;
    fn set_item(&self, key: &str, value: String);
    fn remove_item(&self, key: &str);
}

#[derive(Debug, Default)]
pub struct MemorySessionStorage {
    items: Mutex<HashMap<String, String>>,
}

impl MemorySessionStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStorage for MemorySessionStorage {
    fn get_item(&self, key: &str) -> Option<String> {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn set_item(&self, key: &str, value: String) {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value);
    }

    fn remove_item(&self, key: &str) {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }
}

/// One frozen cart line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckoutLine {
    pub product_id: Uuid,
    pub product_name: String,
    pub quantity: i32,
    pub price_at_addition: Decimal,
}

/// The cart as it looked when checkout began. Totals are computed once here
/// and sent to the server unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckoutCart {
    pub cart_id: Uuid,
    pub items: Vec<CheckoutLine>,
    pub subtotal: Decimal,
    pub shipping_cost: Decimal,
    pub tax_amount: Decimal,
    pub total: Decimal,
}

impl CheckoutCart {
    /// `None` for the empty sentinel or a cart without lines.
    pub fn from_view(view: &CartView) -> Option<Self> {
        let cart_id = view.cart_id?;
        if view.items.is_empty() {
            return None;
        }
        Some(Self {
            cart_id,
            items: view
                .items
                .iter()
                .map(|line| CheckoutLine {
                    product_id: line.product_id,
                    product_name: line.product_name.clone(),
                    quantity: line.quantity,
                    price_at_addition: line.price_at_addition,
                })
                .collect(),
            subtotal: view.subtotal,
            shipping_cost: view.shipping_cost,
            tax_amount: view.tax_amount,
            total: view.total,
        })
    }
}

/// Address plus frozen cart, the hand-off between the address and payment
/// steps.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckoutSession {
    pub address: ShippingAddress,
    pub cart: CheckoutCart,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SnapshotError {
    #[error("No checkout in progress")]
    Missing,
    #[error("Checkout data is corrupted: {0}")]
    Malformed(String),
}

/// Typed access to the checkout keys of a [`SessionStorage`].
pub struct CheckoutSessionStore<S> {
    storage: S,
}

impl<S: SessionStorage> CheckoutSessionStore<S> {
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn save(&self, session: &CheckoutSession) -> Result<(), SnapshotError> {
        let address = serde_json::to_string(&session.address)
            .map_err(|e| SnapshotError::Malformed(e.to_string()))?;
        let cart = serde_json::to_string(&session.cart)
            .map_err(|e| SnapshotError::Malformed(e.to_string()))?;
        self.storage.set_item(CHECKOUT_ADDRESS_KEY, address);
        self.storage.set_item(CHECKOUT_CART_KEY, cart);
        Ok(())
    }

    /// Reads the snapshot back. Both keys must be present, parse, and hold a
    /// valid address and a non-empty cart.
    pub fn load(&self) -> Result<CheckoutSession, SnapshotError> {
        let address: ShippingAddress = self.read(CHECKOUT_ADDRESS_KEY)?;
        let cart: CheckoutCart = self.read(CHECKOUT_CART_KEY)?;

        address
            .validate()
            .map_err(|e| SnapshotError::Malformed(format!("address: {}", e)))?;
        if cart.items.is_empty() {
            return Err(SnapshotError::Malformed("cart has no items".to_string()));
        }

        Ok(CheckoutSession { address, cart })
    }

    pub fn has_snapshot(&self) -> bool {
        self.storage.get_item(CHECKOUT_ADDRESS_KEY).is_some()
            || self.storage.get_item(CHECKOUT_CART_KEY).is_some()
    }

    pub fn clear(&self) {
        self.storage.remove_item(CHECKOUT_ADDRESS_KEY);
        self.storage.remove_item(CHECKOUT_CART_KEY);
    }

    pub fn set_last_order_id(&self, order_id: Uuid) {
        self.storage
            .set_item(LAST_ORDER_ID_KEY, order_id.to_string());
    }

    pub fn last_order_id(&self) -> Option<Uuid> {
        let raw = self.storage.get_item(LAST_ORDER_ID_KEY)?;
        match raw.trim_matches('"').parse() {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(error = %e, "ignoring malformed lastOrderId");
                None
            }
        }
    }

    pub fn clear_last_order_id(&self) {
        self.storage.remove_item(LAST_ORDER_ID_KEY);
    }

    fn read<T: DeserializeOwned>(&self, key: &str) -> Result<T, SnapshotError> {
        let raw = self.storage.get_item(key).ok_or(SnapshotError::Missing)?;
        serde_json::from_str(&raw).map_err(|e| SnapshotError::Malformed(format!("{}: {}", key, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn session() -> CheckoutSession {
        CheckoutSession {
            address: ShippingAddress {
                street: "12 Harbour Road".to_string(),
                city: "Leith".to_string(),
                state: "Lothian".to_string(),
                postal_code: "12345".to_string(),
                country: "UK".to_string(),
            },
            cart: CheckoutCart {
                cart_id: Uuid::new_v4(),
                items: vec![CheckoutLine {
                    product_id: Uuid::new_v4(),
                    product_name: "Mug".to_string(),
                    quantity: 3,
                    price_at_addition: dec!(10.00),
                }],
                subtotal: dec!(30.00),
                shipping_cost: dec!(10.00),
                tax_amount: Decimal::ZERO,
                total: dec!(40.00),
            },
        }
    }

    #[test]
    fn save_then_load() {
        let store = CheckoutSessionStore::new(MemorySessionStorage::new());
        let saved = session();
        store.save(&saved).unwrap();
        assert!(store.has_snapshot());
        assert_eq!(store.load().unwrap(), saved);

        store.clear();
        assert!(!store.has_snapshot());
        assert_eq!(store.load(), Err(SnapshotError::Missing));
    }

    #[test]
    fn missing_cart_key_is_missing() {
        let store = CheckoutSessionStore::new(MemorySessionStorage::new());
        store.save(&session()).unwrap();
        store.storage().remove_item(CHECKOUT_CART_KEY);
        assert_eq!(store.load(), Err(SnapshotError::Missing));
    }

    #[test]
    fn garbage_is_malformed() {
        let store = CheckoutSessionStore::new(MemorySessionStorage::new());
        store.save(&session()).unwrap();
        store
            .storage()
            .set_item(CHECKOUT_CART_KEY, "{not json".to_string());
        assert!(matches!(store.load(), Err(SnapshotError::Malformed(_))));
    }

    #[test]
    fn invalid_stored_address_is_malformed() {
        let store = CheckoutSessionStore::new(MemorySessionStorage::new());
        let mut bad = session();
        bad.address.postal_code = "AB".to_string();
        store.save(&bad).unwrap();
        assert!(matches!(store.load(), Err(SnapshotError::Malformed(_))));
    }

    #[test]
    fn last_order_id_round_trips_and_ignores_garbage() {
        let store = CheckoutSessionStore::new(MemorySessionStorage::new());
        assert_eq!(store.last_order_id(), None);
        let id = Uuid::new_v4();
        store.set_last_order_id(id);
        assert_eq!(store.last_order_id(), Some(id));

        store
            .storage()
            .set_item(LAST_ORDER_ID_KEY, "not-a-uuid".to_string());
        assert_eq!(store.last_order_id(), None);
    }
}
