use crate::{
    auth::CartOwner,
    entities::commerce::{cart, cart_item, Cart, CartItem, CartItemModel, CartModel, Product},
    entities::product,
    errors::ServiceError,
    events::{Event, EventSender},
    services::commerce::pricing_service::{calculate_cart_total, PricingService},
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::OnConflict, ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection,
    EntityTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

/// Authoritative cart store.
///
/// Every cart belongs to exactly one owner key ([`CartOwner`]). Carts are
/// created lazily on the first add and each mutation runs in its own
/// transaction; the returned [`CartView`] is read inside that transaction so
/// callers see the committed state.
#[derive(Clone)]
pub struct CartService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    pricing: PricingService,
}

impl CartService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        pricing: PricingService,
    ) -> Self {
        Self {
            db,
            event_sender,
            pricing,
        }
    }

    /// Returns the owner's cart, or the empty sentinel (`cart_id: None`)
    /// when the owner has not added anything yet.
    #[instrument(skip(self))]
    pub async fn get_cart(&self, owner: &CartOwner) -> Result<CartView, ServiceError> {
        let cart = find_cart(&*self.db, owner).await?;
        self.load_view(&*self.db, cart.as_ref()).await
    }

    pub fn empty_view(&self) -> CartView {
        CartView::empty(&self.pricing)
    }

    /// Total units in the owner's cart, for badges.
    #[instrument(skip(self))]
    pub async fn item_count(&self, owner: &CartOwner) -> Result<i64, ServiceError> {
        Ok(self.get_cart(owner).await?.item_count)
    }

    /// Adds a product to the owner's cart.
    ///
    /// An existing line for the same product is incremented instead of
    /// duplicated and keeps its original `price_at_addition`. The resulting
    /// line quantity must not exceed current stock.
    #[instrument(skip(self))]
    pub async fn add_item(
        &self,
        owner: &CartOwner,
        input: AddToCartInput,
    ) -> Result<CartView, ServiceError> {
        input.validate()?;

        let txn = self.db.begin().await?;

        let product = Product::find_by_id(input.product_id)
            .one(&txn)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Product {} not found", input.product_id))
            })?;

        let (cart, created) = match find_cart(&txn, owner).await? {
            Some(cart) => (cart, false),
            None => create_cart(&txn, owner).await?,
        };

        let existing_item = CartItem::find()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .filter(cart_item::Column::ProductId.eq(product.id))
            .one(&txn)
            .await?;

        let current_quantity = existing_item.as_ref().map(|i| i.quantity).unwrap_or(0);
        let new_quantity = current_quantity.saturating_add(input.quantity);
        if new_quantity > product.stock {
            return Err(ServiceError::InsufficientStock(format!(
                "Only {} of {} in stock ({} already in cart)",
                product.stock, product.name, current_quantity
            )));
        }

        let now = Utc::now();
        if let Some(item) = existing_item {
            let mut item: cart_item::ActiveModel = item.into();
            item.quantity = Set(new_quantity);
            item.updated_at = Set(now);
            item.update(&txn).await?;
        } else {
            cart_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                cart_id: Set(cart.id),
                product_id: Set(product.id),
                quantity: Set(new_quantity),
                price_at_addition: Set(product.price),
                created_at: Set(now),
                updated_at: Set(now),
            }
            .insert(&txn)
            .await?;
        }
        touch_cart(&txn, &cart).await?;

        let view = self.load_view(&txn, Some(&cart)).await?;
        txn.commit().await?;

        if created {
            self.event_sender
                .send_or_log(Event::CartCreated(cart.id))
                .await;
        }
        self.event_sender
            .send_or_log(Event::CartItemAdded {
                cart_id: cart.id,
                product_id: product.id,
            })
            .await;

        info!(
            "Added item to cart {}: product {} x{}",
            cart.id, product.id, input.quantity
        );
        Ok(view)
    }

    /// Sets a line's quantity. The target must lie in `[1, stock]`.
    #[instrument(skip(self))]
    pub async fn update_item_quantity(
        &self,
        owner: &CartOwner,
        item_id: Uuid,
        quantity: i32,
    ) -> Result<CartView, ServiceError> {
        if quantity < 1 {
            return Err(ServiceError::ValidationError(
                "Quantity must be at least 1".to_string(),
            ));
        }

        let txn = self.db.begin().await?;

        let cart = find_cart(&txn, owner)
            .await?
            .ok_or_else(|| ServiceError::NotFound("Cart not found".to_string()))?;
        let item = find_owned_item(&txn, &cart, item_id).await?;

        let product = Product::find_by_id(item.product_id)
            .one(&txn)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Product {} not found", item.product_id))
            })?;
        if quantity > product.stock {
            return Err(ServiceError::InsufficientStock(format!(
                "Only {} of {} in stock",
                product.stock, product.name
            )));
        }

        let mut item: cart_item::ActiveModel = item.into();
        item.quantity = Set(quantity);
        item.updated_at = Set(Utc::now());
        item.update(&txn).await?;
        touch_cart(&txn, &cart).await?;

        let view = self.load_view(&txn, Some(&cart)).await?;
        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::CartItemUpdated {
                cart_id: cart.id,
                item_id,
            })
            .await;

        Ok(view)
    }

    #[instrument(skip(self))]
    pub async fn remove_item(
        &self,
        owner: &CartOwner,
        item_id: Uuid,
    ) -> Result<CartView, ServiceError> {
        let txn = self.db.begin().await?;

        let cart = find_cart(&txn, owner)
            .await?
            .ok_or_else(|| ServiceError::NotFound("Cart not found".to_string()))?;

        let result = CartItem::delete_many()
            .filter(cart_item::Column::Id.eq(item_id))
            .filter(cart_item::Column::CartId.eq(cart.id))
            .exec(&txn)
            .await?;
        if result.rows_affected == 0 {
            return Err(ServiceError::NotFound(format!(
                "Cart item {} not found",
                item_id
            )));
        }
        touch_cart(&txn, &cart).await?;

        let view = self.load_view(&txn, Some(&cart)).await?;
        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::CartItemRemoved {
                cart_id: cart.id,
                item_id,
            })
            .await;

        Ok(view)
    }

    /// Removes every line from the owner's cart. The cart row itself stays.
    #[instrument(skip(self))]
    pub async fn clear_cart(
        &self,
        owner: &CartOwner,
        cart_id: Uuid,
    ) -> Result<CartView, ServiceError> {
        let txn = self.db.begin().await?;

        let cart = find_cart(&txn, owner)
            .await?
            .filter(|c| c.id == cart_id)
            .ok_or_else(|| ServiceError::NotFound(format!("Cart {} not found", cart_id)))?;

        CartItem::delete_many()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .exec(&txn)
            .await?;
        touch_cart(&txn, &cart).await?;

        let view = self.load_view(&txn, Some(&cart)).await?;
        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::CartCleared(cart.id))
            .await;

        info!("Cleared cart {}", cart.id);
        Ok(view)
    }

    /// Folds the guest cart identified by `guest_token` into the user's cart.
    ///
    /// Lines for the same product are summed and the user's price snapshot
    /// survives; guest-only lines move over with their own snapshot. Every
    /// resulting quantity is clamped to current stock and lines clamped to
    /// zero are dropped. The guest cart is deleted. Without a guest cart this
    /// is a no-op returning the user's cart.
    #[instrument(skip(self, guest_token))]
    pub async fn merge_guest_cart(
        &self,
        user_id: Uuid,
        guest_token: &str,
    ) -> Result<MergeOutcome, ServiceError> {
        let user_owner = CartOwner::User(user_id);
        let guest_owner = CartOwner::Guest(guest_token.to_string());

        let txn = self.db.begin().await?;

        let Some(guest_cart) = find_cart(&txn, &guest_owner).await? else {
            let user_cart = find_cart(&txn, &user_owner).await?;
            let cart = self.load_view(&txn, user_cart.as_ref()).await?;
            txn.commit().await?;
            return Ok(MergeOutcome {
                cart,
                adjustments: Vec::new(),
            });
        };

        let (user_cart, created) = match find_cart(&txn, &user_owner).await? {
            Some(cart) => (cart, false),
            None => create_cart(&txn, &user_owner).await?,
        };

        let guest_lines = CartItem::find()
            .filter(cart_item::Column::CartId.eq(guest_cart.id))
            .find_also_related(Product)
            .all(&txn)
            .await?;

        let mut adjustments = Vec::new();
        let now = Utc::now();

        for (guest_line, product) in guest_lines {
            let (stock, product_name) = product
                .map(|p| (p.stock, p.name))
                .unwrap_or((0, String::new()));

            let user_line = CartItem::find()
                .filter(cart_item::Column::CartId.eq(user_cart.id))
                .filter(cart_item::Column::ProductId.eq(guest_line.product_id))
                .one(&txn)
                .await?;

            let requested = guest_line
                .quantity
                .saturating_add(user_line.as_ref().map(|l| l.quantity).unwrap_or(0));
            let merged = clamp_to_stock(requested, stock);

            if merged != requested {
                adjustments.push(MergeAdjustment {
                    product_id: guest_line.product_id,
                    product_name,
                    requested,
                    merged,
                });
            }

            match user_line {
                Some(line) if merged == 0 => {
                    CartItem::delete_by_id(line.id).exec(&txn).await?;
                }
                Some(line) => {
                    let mut line: cart_item::ActiveModel = line.into();
                    line.quantity = Set(merged);
                    line.updated_at = Set(now);
                    line.update(&txn).await?;
                }
                None if merged == 0 => {}
                None => {
                    let mut moved: cart_item::ActiveModel = guest_line.clone().into();
                    moved.cart_id = Set(user_cart.id);
                    moved.quantity = Set(merged);
                    moved.updated_at = Set(now);
                    moved.update(&txn).await?;
                }
            }
        }

        CartItem::delete_many()
            .filter(cart_item::Column::CartId.eq(guest_cart.id))
            .exec(&txn)
            .await?;
        Cart::delete_by_id(guest_cart.id).exec(&txn).await?;
        touch_cart(&txn, &user_cart).await?;

        let cart = self.load_view(&txn, Some(&user_cart)).await?;
        txn.commit().await?;

        if created {
            self.event_sender
                .send_or_log(Event::CartCreated(user_cart.id))
                .await;
        }
        self.event_sender
            .send_or_log(Event::CartMerged {
                guest_cart_id: guest_cart.id,
                user_cart_id: user_cart.id,
                clamped_lines: adjustments.len(),
            })
            .await;

        if !adjustments.is_empty() {
            warn!(
                user_cart_id = %user_cart.id,
                clamped = adjustments.len(),
                "merged guest cart with quantities clamped to stock"
            );
        }
        info!("Merged guest cart {} into {}", guest_cart.id, user_cart.id);

        Ok(MergeOutcome { cart, adjustments })
    }

    async fn load_view<C: ConnectionTrait>(
        &self,
        conn: &C,
        cart: Option<&CartModel>,
    ) -> Result<CartView, ServiceError> {
        let Some(cart) = cart else {
            return Ok(CartView::empty(&self.pricing));
        };

        let rows = CartItem::find()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .order_by_asc(cart_item::Column::CreatedAt)
            .order_by_asc(cart_item::Column::Id)
            .find_also_related(Product)
            .all(conn)
            .await?;

        let items: Vec<CartLineView> = rows
            .into_iter()
            .map(|(item, product)| CartLineView::new(item, product))
            .collect();

        let subtotal =
            calculate_cart_total(items.iter().map(|l| (l.price_at_addition, l.quantity)));
        let totals = self.pricing.quote(subtotal);

        Ok(CartView {
            cart_id: Some(cart.id),
            item_count: items.iter().map(|l| i64::from(l.quantity)).sum(),
            items,
            subtotal: totals.subtotal,
            shipping_cost: totals.shipping_cost,
            tax_amount: totals.tax_amount,
            total: totals.total,
        })
    }
}

/// Merged quantity for a line: the requested quantity, capped by stock.
pub fn clamp_to_stock(requested: i32, stock: i32) -> i32 {
    requested.min(stock.max(0)).max(0)
}

pub(crate) async fn find_cart<C: ConnectionTrait>(
    conn: &C,
    owner: &CartOwner,
) -> Result<Option<CartModel>, ServiceError> {
    let query = match owner {
        CartOwner::User(id) => Cart::find().filter(cart::Column::CustomerId.eq(*id)),
        CartOwner::Guest(token) => Cart::find().filter(cart::Column::SessionId.eq(token.clone())),
    };
    Ok(query.one(conn).await?)
}

/// Inserts the owner's cart unless a concurrent request already did, then
/// reads back whichever row holds the owner key. The flag reports whether
/// this call created it.
async fn create_cart<C: ConnectionTrait>(
    conn: &C,
    owner: &CartOwner,
) -> Result<(CartModel, bool), ServiceError> {
    let now = Utc::now();
    let owner_key = match owner {
        CartOwner::User(_) => cart::Column::CustomerId,
        CartOwner::Guest(_) => cart::Column::SessionId,
    };
    let inserted = Cart::insert(cart::ActiveModel {
        id: Set(Uuid::new_v4()),
        session_id: Set(owner.session_id().map(str::to_string)),
        customer_id: Set(owner.user_id()),
        created_at: Set(now),
        updated_at: Set(now),
    })
    .on_conflict(OnConflict::column(owner_key).do_nothing().to_owned())
    .exec_without_returning(conn)
    .await?;

    let cart = find_cart(conn, owner).await?.ok_or_else(|| {
        ServiceError::InternalError(format!("Cart for {} vanished after insert", owner))
    })?;

    if inserted > 0 {
        info!("Created cart {} for {}", cart.id, owner);
    }
    Ok((cart, inserted > 0))
}

async fn touch_cart<C: ConnectionTrait>(conn: &C, cart: &CartModel) -> Result<(), ServiceError> {
    let mut active: cart::ActiveModel = cart.clone().into();
    active.updated_at = Set(Utc::now());
    active.update(conn).await?;
    Ok(())
}

async fn find_owned_item<C: ConnectionTrait>(
    conn: &C,
    cart: &CartModel,
    item_id: Uuid,
) -> Result<CartItemModel, ServiceError> {
    CartItem::find_by_id(item_id)
        .filter(cart_item::Column::CartId.eq(cart.id))
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Cart item {} not found", item_id)))
}

/// Input for adding items to cart
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AddToCartInput {
    pub product_id: Uuid,
    #[validate(range(min = 1, message = "Quantity must be at least 1"))]
    pub quantity: i32,
}

/// One cart line as shown to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartLineView {
    pub id: Uuid,
    pub product_id: Uuid,
    pub product_name: String,
    pub quantity: i32,
    pub price_at_addition: Decimal,
    pub subtotal: Decimal,
    pub available_stock: i32,
}

impl CartLineView {
    fn new(item: CartItemModel, product: Option<product::Model>) -> Self {
        let (product_name, available_stock) = product
            .map(|p| (p.name, p.stock))
            .unwrap_or_default();
        Self {
            id: item.id,
            product_id: item.product_id,
            product_name,
            subtotal: item.subtotal(),
            quantity: item.quantity,
            price_at_addition: item.price_at_addition,
            available_stock,
        }
    }
}

/// Cart contents with totals priced by the configured policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartView {
    /// `None` when the owner has no cart yet.
    pub cart_id: Option<Uuid>,
    pub items: Vec<CartLineView>,
    pub item_count: i64,
    pub subtotal: Decimal,
    pub shipping_cost: Decimal,
    pub tax_amount: Decimal,
    pub total: Decimal,
}

impl CartView {
    pub fn empty(pricing: &PricingService) -> Self {
        let totals = pricing.quote(Decimal::ZERO);
        Self {
            cart_id: None,
            items: Vec::new(),
            item_count: 0,
            subtotal: totals.subtotal,
            shipping_cost: totals.shipping_cost,
            tax_amount: totals.tax_amount,
            total: totals.total,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn line(&self, item_id: Uuid) -> Option<&CartLineView> {
        self.items.iter().find(|l| l.id == item_id)
    }
}

/// A guest line whose merged quantity was capped by stock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeAdjustment {
    pub product_id: Uuid,
    pub product_name: String,
    pub requested: i32,
    pub merged: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeOutcome {
    pub cart: CartView,
    pub adjustments: Vec<MergeAdjustment>,
}
