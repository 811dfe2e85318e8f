use super::ClientError;
use crate::services::commerce::CartView;
use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Server calls the cart client depends on.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CartGateway: Send + Sync {
    async fn get_cart(&self) -> Result<CartView, ClientError>;
    async fn add_item(&self, product_id: Uuid, quantity: i32) -> Result<CartView, ClientError>;
    async fn update_item(&self, item_id: Uuid, quantity: i32) -> Result<CartView, ClientError>;
    async fn remove_item(&self, item_id: Uuid) -> Result<CartView, ClientError>;
    async fn clear_cart(&self, cart_id: Uuid) -> Result<CartView, ClientError>;
}

/// What subscribers see.
#[derive(Debug, Clone, PartialEq)]
pub enum CartState {
    Loading,
    Ready(CartView),
    /// Last fetch failed; the UI offers a retry.
    Failed { message: String },
}

impl CartState {
    /// Badge count. Zero unless a cart has loaded.
    pub fn item_count(&self) -> i64 {
        match self {
            CartState::Ready(view) => view.item_count,
            _ => 0,
        }
    }

    pub fn view(&self) -> Option<&CartView> {
        match self {
            CartState::Ready(view) => Some(view),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum QuantityChange {
    Applied(CartView),
    /// Target quantity fell outside `[1, max]`; nothing was sent.
    Blocked {
        item_id: Uuid,
        requested: i32,
        max: i32,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome {
    Applied(CartView),
    Declined,
}

/// Asks the user before a destructive cart change.
pub trait Confirm: Send + Sync {
    fn confirm(&self, prompt: &str) -> bool;
}

impl<F> Confirm for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn confirm(&self, prompt: &str) -> bool {
        self(prompt)
    }
}

/// The single `watch` store behind the badge and the cart page.
///
/// Cloning hands out another publisher for the same store, so flows that
/// change the cart outside [`CartClient`] (checkout clearing it after an
/// order) publish where every subscriber already listens.
#[derive(Clone)]
pub struct CartStore {
    sender: Arc<watch::Sender<CartState>>,
}

impl CartStore {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(CartState::Loading);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn publish(&self, state: CartState) {
        self.sender.send_replace(state);
    }

    pub fn subscribe(&self) -> watch::Receiver<CartState> {
        self.sender.subscribe()
    }

    pub fn current(&self) -> CartState {
        self.sender.borrow().clone()
    }
}

impl Default for CartStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Cart state shared by every view of the cart.
///
/// Mutations go to the server and are followed by a full refetch; the fresh
/// view is published through the [`CartStore`] so the badge and the cart page
/// never disagree.
pub struct CartClient<G> {
    gateway: Arc<G>,
    state: CartStore,
}

impl<G> CartClient<G>
where
    G: CartGateway + 'static,
{
    pub fn new(gateway: Arc<G>) -> Self {
        Self {
            gateway,
            state: CartStore::new(),
        }
    }

    /// Another handle on this client's store.
    pub fn store(&self) -> CartStore {
        self.state.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CartState> {
        self.state.subscribe()
    }

    pub fn current(&self) -> CartState {
        self.state.current()
    }

    /// Loads the cart and publishes it. A guest with no cart gets the empty
    /// view (`cart_id: None`).
    #[instrument(skip(self))]
    pub async fn fetch_cart(&self) -> Result<CartView, ClientError> {
        match self.gateway.get_cart().await {
            Ok(view) => {
                self.state.publish(CartState::Ready(view.clone()));
                Ok(view)
            }
            Err(err) => {
                warn!(error = %err, "failed to fetch cart");
                self.state.publish(CartState::Failed {
                    message: err.to_string(),
                });
                Err(err)
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn add_item(&self, product_id: Uuid, quantity: i32) -> Result<CartView, ClientError> {
        self.gateway.add_item(product_id, quantity).await?;
        self.fetch_cart().await
    }

    /// Moves a line's quantity by `delta`, staying within `[1, available_stock]`.
    #[instrument(skip(self))]
    pub async fn change_quantity(
        &self,
        item_id: Uuid,
        delta: i32,
    ) -> Result<QuantityChange, ClientError> {
        let line = match self.known_line(item_id) {
            Some(line) => line,
            None => {
                let view = self.fetch_cart().await?;
                view.line(item_id)
                    .map(|l| (l.quantity, l.available_stock))
                    .ok_or_else(|| ClientError::NotFound(format!("Cart item {}", item_id)))?
            }
        };
        let (quantity, max) = line;
        let requested = quantity.saturating_add(delta);

        if requested < 1 || requested > max {
            debug!(requested, max, "quantity change blocked");
            return Ok(QuantityChange::Blocked {
                item_id,
                requested,
                max,
            });
        }

        self.gateway.update_item(item_id, requested).await?;
        Ok(QuantityChange::Applied(self.fetch_cart().await?))
    }

    #[instrument(skip(self, confirm))]
    pub async fn remove_item(
        &self,
        item_id: Uuid,
        confirm: &dyn Confirm,
    ) -> Result<MutationOutcome, ClientError> {
        if !confirm.confirm("Remove this item from your cart?") {
            return Ok(MutationOutcome::Declined);
        }
        self.gateway.remove_item(item_id).await?;
        Ok(MutationOutcome::Applied(self.fetch_cart().await?))
    }

    #[instrument(skip(self, confirm))]
    pub async fn clear_cart(&self, confirm: &dyn Confirm) -> Result<MutationOutcome, ClientError> {
        if !confirm.confirm("Remove all items from your cart?") {
            return Ok(MutationOutcome::Declined);
        }
        let cart_id = match self.current().view().and_then(|v| v.cart_id) {
            Some(id) => Some(id),
            None => self.fetch_cart().await?.cart_id,
        };
        if let Some(cart_id) = cart_id {
            self.gateway.clear_cart(cart_id).await?;
        }
        Ok(MutationOutcome::Applied(self.fetch_cart().await?))
    }

    /// Polls the cart every `interval` until the client is dropped. Results
    /// are published through the same store as explicit fetches.
    pub fn spawn_refresh(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(client) = weak.upgrade() else {
                    break;
                };
                // Failures are already published as CartState::Failed.
                let _ = client.fetch_cart().await;
            }
        })
    }

    fn known_line(&self, item_id: Uuid) -> Option<(i32, i32)> {
        self.state
            .sender
            .borrow()
            .view()
            .and_then(|v| v.line(item_id))
            .map(|l| (l.quantity, l.available_stock))
    }
}
