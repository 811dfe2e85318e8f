use super::{
    cart::{CartState, CartStore},
    session::{CheckoutCart, CheckoutSession, CheckoutSessionStore, SessionStorage, SnapshotError},
    ClientError,
};
use crate::{
    entities::order::PaymentMethod,
    services::{
        commerce::CartView,
        orders::{CreateOrderRequest, OrderLineInput, OrderResponse, ShippingAddress},
    },
};
use async_trait::async_trait;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, PoisonError,
};
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

/// Server calls checkout depends on.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CheckoutGateway: Send + Sync {
    async fn create_order(&self, request: &CreateOrderRequest)
        -> Result<OrderResponse, ClientError>;
    async fn clear_cart(&self, cart_id: Uuid) -> Result<CartView, ClientError>;
    async fn get_order(&self, order_id: Uuid) -> Result<OrderResponse, ClientError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum CheckoutStep {
    Cart,
    AddressCapture,
    PaymentSelection,
    OrderConfirmed,
}

/// Where the user is sent when checkout data is unusable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Redirect {
    Cart,
}

impl Redirect {
    pub fn path(&self) -> &'static str {
        match self {
            Redirect::Cart => "/cart",
        }
    }
}

#[derive(Debug, Error)]
pub enum CheckoutError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Cannot check out an empty cart")]
    EmptyCart,

    #[error("Checkout is at {actual}, expected {expected}")]
    InvalidStep {
        expected: CheckoutStep,
        actual: CheckoutStep,
    },

    #[error("Order submission already in progress")]
    AlreadyProcessing,

    /// Stock or prices moved since checkout began; the user has to revisit
    /// the cart.
    #[error("Cart changed: {0}")]
    StockConflict(String),

    #[error("Redirect to {}", .0.path())]
    Redirect(Redirect),

    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Parses a payment method from its wire name (`credit_card`, `paypal`, ...).
pub fn parse_payment_method(value: &str) -> Result<PaymentMethod, CheckoutError> {
    value
        .trim()
        .parse::<PaymentMethod>()
        .map_err(|_| CheckoutError::Validation(format!("Unknown payment method: {}", value)))
}

#[derive(Debug)]
struct Progress {
    step: CheckoutStep,
    /// Cart frozen by `begin`, held until the address step persists it.
    cart: Option<CheckoutCart>,
}

/// Clears the processing flag when the submission finishes, however it ends.
struct ProcessingGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> ProcessingGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Drives `Cart → AddressCapture → PaymentSelection → OrderConfirmed`.
///
/// The address and frozen cart survive reloads through the session store;
/// the in-memory step is rebuilt from it by [`CheckoutSequencer::resume`].
/// Clearing the cart after an order is published to the shared [`CartStore`].
pub struct CheckoutSequencer<G, S> {
    gateway: Arc<G>,
    store: CheckoutSessionStore<S>,
    cart: CartStore,
    progress: Mutex<Progress>,
    processing: AtomicBool,
}

impl<G, S> CheckoutSequencer<G, S>
where
    G: CheckoutGateway,
    S: SessionStorage,
{
    pub fn new(gateway: Arc<G>, storage: S, cart: CartStore) -> Self {
        Self {
            gateway,
            store: CheckoutSessionStore::new(storage),
            cart,
            progress: Mutex::new(Progress {
                step: CheckoutStep::Cart,
                cart: None,
            }),
            processing: AtomicBool::new(false),
        }
    }

    pub fn step(&self) -> CheckoutStep {
        self.lock().step
    }

    pub fn store(&self) -> &CheckoutSessionStore<S> {
        &self.store
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::Acquire)
    }

    /// Freezes the cart and moves to address capture.
    #[instrument(skip_all)]
    pub fn begin(&self, cart: &CartView) -> Result<(), CheckoutError> {
        let mut progress = self.lock();
        if !matches!(
            progress.step,
            CheckoutStep::Cart | CheckoutStep::OrderConfirmed
        ) {
            return Err(CheckoutError::InvalidStep {
                expected: CheckoutStep::Cart,
                actual: progress.step,
            });
        }
        let frozen = CheckoutCart::from_view(cart).ok_or(CheckoutError::EmptyCart)?;

        self.store.clear_last_order_id();
        progress.cart = Some(frozen);
        progress.step = CheckoutStep::AddressCapture;
        Ok(())
    }

    /// Validates the address and persists the snapshot. Invalid input leaves
    /// the step unchanged.
    #[instrument(skip_all)]
    pub fn submit_address(&self, address: ShippingAddress) -> Result<(), CheckoutError> {
        let mut progress = self.lock();
        if progress.step != CheckoutStep::AddressCapture {
            return Err(CheckoutError::InvalidStep {
                expected: CheckoutStep::AddressCapture,
                actual: progress.step,
            });
        }
        address
            .validate()
            .map_err(|e| CheckoutError::Validation(e.to_string()))?;

        let cart = progress
            .cart
            .clone()
            .ok_or(CheckoutError::Redirect(Redirect::Cart))?;
        self.store
            .save(&CheckoutSession { address, cart })
            .map_err(|e| CheckoutError::Validation(e.to_string()))?;

        progress.step = CheckoutStep::PaymentSelection;
        Ok(())
    }

    /// Loads the snapshot for the payment page.
    pub fn enter_payment(&self) -> Result<CheckoutSession, Redirect> {
        match self.store.load() {
            Ok(session) => {
                let mut progress = self.lock();
                progress.step = CheckoutStep::PaymentSelection;
                progress.cart = Some(session.cart.clone());
                Ok(session)
            }
            Err(err) => {
                warn!(error = %err, "checkout snapshot unusable, returning to cart");
                self.reset();
                Err(Redirect::Cart)
            }
        }
    }

    /// Places the order. Only one submission runs at a time.
    ///
    /// On failure the snapshot and the live cart are left alone so the user
    /// can retry from the payment step.
    #[instrument(skip(self))]
    pub async fn submit_payment(
        &self,
        payment_method: PaymentMethod,
    ) -> Result<OrderResponse, CheckoutError> {
        let _guard =
            ProcessingGuard::acquire(&self.processing).ok_or(CheckoutError::AlreadyProcessing)?;

        let step = self.step();
        if step != CheckoutStep::PaymentSelection {
            return Err(CheckoutError::InvalidStep {
                expected: CheckoutStep::PaymentSelection,
                actual: step,
            });
        }

        let session = match self.store.load() {
            Ok(session) => session,
            Err(err) => {
                warn!(error = %err, "checkout snapshot unusable at submit");
                self.reset();
                return Err(CheckoutError::Redirect(Redirect::Cart));
            }
        };

        let request = order_request(&session, payment_method);
        let order = self
            .gateway
            .create_order(&request)
            .await
            .map_err(|err| match err {
                ClientError::StockConflict(message) => CheckoutError::StockConflict(message),
                other => CheckoutError::Client(other),
            })?;

        match self.gateway.clear_cart(session.cart.cart_id).await {
            Ok(view) => self.cart.publish(CartState::Ready(view)),
            Err(err) => {
                warn!(error = %err, order_id = %order.id, "order placed but cart was not cleared")
            }
        }
        self.store.clear();
        self.store.set_last_order_id(order.id);
        {
            let mut progress = self.lock();
            progress.step = CheckoutStep::OrderConfirmed;
            progress.cart = None;
        }

        info!(order_id = %order.id, order_number = %order.order_number, "order placed");
        Ok(order)
    }

    /// Rebuilds the step after a reload.
    pub fn resume(&self) -> CheckoutStep {
        let (step, cart) = match self.store.load() {
            Ok(session) => (CheckoutStep::PaymentSelection, Some(session.cart)),
            Err(SnapshotError::Malformed(reason)) => {
                warn!(%reason, "discarding malformed checkout snapshot");
                self.store.clear();
                (CheckoutStep::Cart, None)
            }
            Err(SnapshotError::Missing) => {
                if self.store.has_snapshot() {
                    self.store.clear();
                }
                match self.store.last_order_id() {
                    Some(_) => (CheckoutStep::OrderConfirmed, None),
                    None => (CheckoutStep::Cart, None),
                }
            }
        };

        let mut progress = self.lock();
        progress.step = step;
        progress.cart = cart;
        step
    }

    /// Drops the snapshot and returns to the cart.
    pub fn abandon(&self) {
        self.store.clear();
        self.reset();
    }

    /// Fetches the order placed by the last successful submission.
    pub async fn confirmation(&self) -> Result<OrderResponse, CheckoutError> {
        let order_id = self
            .store
            .last_order_id()
            .ok_or(CheckoutError::Redirect(Redirect::Cart))?;
        Ok(self.gateway.get_order(order_id).await?)
    }

    fn reset(&self) {
        let mut progress = self.lock();
        progress.step = CheckoutStep::Cart;
        progress.cart = None;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Progress> {
        self.progress.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn order_request(session: &CheckoutSession, payment_method: PaymentMethod) -> CreateOrderRequest {
    let cart = &session.cart;
    CreateOrderRequest {
        cart_id: cart.cart_id,
        shipping_address: session.address.clone(),
        payment_method,
        items: cart
            .items
            .iter()
            .map(|line| OrderLineInput {
                product_id: line.product_id,
                quantity: line.quantity,
                price_at_purchase: line.price_at_addition,
            })
            .collect(),
        subtotal: cart.subtotal,
        shipping_cost: cart.shipping_cost,
        tax_amount: cart.tax_amount,
        total_amount: cart.total,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::session::{MemorySessionStorage, CHECKOUT_CART_KEY};
    use crate::entities::order::{OrderStatus, PaymentStatus};
    use crate::services::commerce::CartLineView;
    use assert_matches::assert_matches;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn cart_view() -> CartView {
        CartView {
            cart_id: Some(Uuid::new_v4()),
            items: vec![CartLineView {
                id: Uuid::new_v4(),
                product_id: Uuid::new_v4(),
                product_name: "Mug".to_string(),
                quantity: 3,
                price_at_addition: dec!(10.00),
                subtotal: dec!(30.00),
                available_stock: 100,
            }],
            item_count: 3,
            subtotal: dec!(30.00),
            shipping_cost: dec!(10.00),
            tax_amount: Decimal::ZERO,
            total: dec!(40.00),
        }
    }

    fn address() -> ShippingAddress {
        ShippingAddress {
            street: "12 Harbour Road".to_string(),
            city: "Leith".to_string(),
            state: "Lothian".to_string(),
            postal_code: "12345".to_string(),
            country: "UK".to_string(),
        }
    }

    fn order_for(request: &CreateOrderRequest) -> OrderResponse {
        let id = Uuid::new_v4();
        OrderResponse {
            id,
            order_number: crate::services::orders::order_number_for(id),
            status: OrderStatus::Pending,
            payment_status: PaymentStatus::Pending,
            payment_method: request.payment_method,
            shipping_address: request.shipping_address.clone(),
            items: Vec::new(),
            subtotal_amount: request.subtotal,
            shipping_cost: request.shipping_cost,
            tax_amount: request.tax_amount,
            total_amount: request.total_amount,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn sequencer(
        gateway: MockCheckoutGateway,
    ) -> CheckoutSequencer<MockCheckoutGateway, MemorySessionStorage> {
        CheckoutSequencer::new(
            Arc::new(gateway),
            MemorySessionStorage::new(),
            CartStore::new(),
        )
    }

    #[test]
    fn empty_cart_cannot_begin() {
        let checkout = sequencer(MockCheckoutGateway::new());
        let mut empty = cart_view();
        empty.items.clear();
        assert_matches!(checkout.begin(&empty), Err(CheckoutError::EmptyCart));
        assert_eq!(checkout.step(), CheckoutStep::Cart);
    }

    #[test]
    fn invalid_address_blocks_payment_step() {
        let checkout = sequencer(MockCheckoutGateway::new());
        checkout.begin(&cart_view()).unwrap();

        let mut bad = address();
        bad.street = "  ab ".to_string();
        assert_matches!(
            checkout.submit_address(bad),
            Err(CheckoutError::Validation(_))
        );
        let mut bad_postal = address();
        bad_postal.postal_code = "12a45".to_string();
        assert_matches!(
            checkout.submit_address(bad_postal),
            Err(CheckoutError::Validation(_))
        );

        assert_eq!(checkout.step(), CheckoutStep::AddressCapture);
        assert!(!checkout.store().has_snapshot());
    }

    #[test]
    fn address_cannot_be_submitted_before_begin() {
        let checkout = sequencer(MockCheckoutGateway::new());
        assert_matches!(
            checkout.submit_address(address()),
            Err(CheckoutError::InvalidStep { .. })
        );
    }

    #[tokio::test]
    async fn payment_cannot_be_submitted_from_address_step() {
        let mut gateway = MockCheckoutGateway::new();
        gateway.expect_create_order().never();
        let checkout = sequencer(gateway);
        checkout.begin(&cart_view()).unwrap();
        assert_matches!(
            checkout.submit_payment(PaymentMethod::CreditCard).await,
            Err(CheckoutError::InvalidStep { .. })
        );
    }

    #[tokio::test]
    async fn successful_submission_clears_snapshot_and_records_order() {
        let view = cart_view();
        let cart_id = view.cart_id.unwrap();
        let mut gateway = MockCheckoutGateway::new();
        gateway
            .expect_create_order()
            .withf(move |req| {
                req.cart_id == cart_id
                    && req.total_amount == dec!(40.00)
                    && req.items.len() == 1
                    && req.items[0].price_at_purchase == dec!(10.00)
            })
            .times(1)
            .returning(|req| Ok(order_for(req)));
        gateway
            .expect_clear_cart()
            .with(mockall::predicate::eq(cart_id))
            .times(1)
            .returning(|_| Err(ClientError::Network("flaky".into())));

        let checkout = sequencer(gateway);
        checkout.begin(&view).unwrap();
        checkout.submit_address(address()).unwrap();
        assert_eq!(checkout.step(), CheckoutStep::PaymentSelection);

        let order = checkout
            .submit_payment(PaymentMethod::CreditCard)
            .await
            .unwrap();
        assert!(order.order_number.starts_with("ORD-"));
        assert_eq!(checkout.step(), CheckoutStep::OrderConfirmed);
        assert!(!checkout.store().has_snapshot());
        assert_eq!(checkout.store().last_order_id(), Some(order.id));
        assert!(!checkout.is_processing());
    }

    #[tokio::test]
    async fn cleared_cart_reaches_badge_subscribers() {
        let view = cart_view();
        let cart_id = view.cart_id.unwrap();
        let mut gateway = MockCheckoutGateway::new();
        gateway
            .expect_create_order()
            .times(1)
            .returning(|req| Ok(order_for(req)));
        gateway
            .expect_clear_cart()
            .with(mockall::predicate::eq(cart_id))
            .times(1)
            .returning(move |_| {
                let mut cleared = cart_view();
                cleared.cart_id = Some(cart_id);
                cleared.items.clear();
                cleared.item_count = 0;
                Ok(cleared)
            });

        let cart = CartStore::new();
        cart.publish(CartState::Ready(view.clone()));
        let mut badge = cart.subscribe();
        assert_eq!(badge.borrow_and_update().item_count(), 3);

        let checkout =
            CheckoutSequencer::new(Arc::new(gateway), MemorySessionStorage::new(), cart.clone());
        checkout.begin(&view).unwrap();
        checkout.submit_address(address()).unwrap();
        checkout
            .submit_payment(PaymentMethod::CreditCard)
            .await
            .unwrap();

        assert!(badge.has_changed().unwrap());
        assert_eq!(badge.borrow_and_update().item_count(), 0);
        assert_eq!(cart.current().view().and_then(|v| v.cart_id), Some(cart_id));
    }

    #[tokio::test]
    async fn failed_submission_keeps_snapshot_for_retry() {
        let mut gateway = MockCheckoutGateway::new();
        gateway
            .expect_create_order()
            .times(1)
            .returning(|_| Err(ClientError::StockConflict("Only 1 left".into())));
        gateway.expect_clear_cart().never();

        let checkout = sequencer(gateway);
        checkout.begin(&cart_view()).unwrap();
        checkout.submit_address(address()).unwrap();

        assert_matches!(
            checkout.submit_payment(PaymentMethod::Paypal).await,
            Err(CheckoutError::StockConflict(_))
        );
        assert_eq!(checkout.step(), CheckoutStep::PaymentSelection);
        assert!(checkout.store().load().is_ok());
        assert_eq!(checkout.store().last_order_id(), None);
        assert!(!checkout.is_processing());
    }

    #[tokio::test]
    async fn missing_snapshot_redirects_to_cart() {
        let mut gateway = MockCheckoutGateway::new();
        gateway.expect_create_order().never();
        let checkout = sequencer(gateway);
        checkout.begin(&cart_view()).unwrap();
        checkout.submit_address(address()).unwrap();

        checkout.store().storage().remove_item(CHECKOUT_CART_KEY);
        assert_matches!(
            checkout.submit_payment(PaymentMethod::CreditCard).await,
            Err(CheckoutError::Redirect(Redirect::Cart))
        );
        assert_eq!(checkout.step(), CheckoutStep::Cart);
        assert_eq!(checkout.enter_payment(), Err(Redirect::Cart));
    }

    #[test]
    fn processing_guard_is_exclusive() {
        let flag = AtomicBool::new(false);
        let first = ProcessingGuard::acquire(&flag).unwrap();
        assert!(ProcessingGuard::acquire(&flag).is_none());
        drop(first);
        assert!(ProcessingGuard::acquire(&flag).is_some());
    }

    #[test]
    fn resume_rebuilds_step_from_storage() {
        let checkout = sequencer(MockCheckoutGateway::new());
        assert_eq!(checkout.resume(), CheckoutStep::Cart);

        checkout.begin(&cart_view()).unwrap();
        checkout.submit_address(address()).unwrap();

        let reloaded = CheckoutSequencer::new(
            Arc::new(MockCheckoutGateway::new()),
            MemorySessionStorage::new(),
            CartStore::new(),
        );
        let raw_address = checkout
            .store()
            .storage()
            .get_item(crate::client::session::CHECKOUT_ADDRESS_KEY)
            .unwrap();
        let raw_cart = checkout
            .store()
            .storage()
            .get_item(CHECKOUT_CART_KEY)
            .unwrap();
        let storage = reloaded.store().storage();
        storage.set_item(crate::client::session::CHECKOUT_ADDRESS_KEY, raw_address);
        storage.set_item(CHECKOUT_CART_KEY, raw_cart);
        assert_eq!(reloaded.resume(), CheckoutStep::PaymentSelection);
        assert!(reloaded.enter_payment().is_ok());

        storage.set_item(CHECKOUT_CART_KEY, "[]".to_string());
        assert_eq!(reloaded.resume(), CheckoutStep::Cart);
        assert!(!reloaded.store().has_snapshot());
    }

    #[test]
    fn abandon_drops_snapshot() {
        let checkout = sequencer(MockCheckoutGateway::new());
        checkout.begin(&cart_view()).unwrap();
        checkout.submit_address(address()).unwrap();
        checkout.abandon();
        assert_eq!(checkout.step(), CheckoutStep::Cart);
        assert!(!checkout.store().has_snapshot());
    }

    #[tokio::test]
    async fn confirmation_without_order_redirects() {
        let checkout = sequencer(MockCheckoutGateway::new());
        assert_matches!(
            checkout.confirmation().await,
            Err(CheckoutError::Redirect(Redirect::Cart))
        );
    }

    #[test]
    fn payment_method_parsing() {
        assert_eq!(
            parse_payment_method("credit_card").unwrap(),
            PaymentMethod::CreditCard
        );
        assert_eq!(
            parse_payment_method(" bank_transfer ").unwrap(),
            PaymentMethod::BankTransfer
        );
        assert_matches!(
            parse_payment_method("cash"),
            Err(CheckoutError::Validation(_))
        );
    }
}
