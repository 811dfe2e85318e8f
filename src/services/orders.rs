use crate::{
    auth::CartOwner,
    entities::commerce::{cart_item, CartItem},
    entities::order::{
        self, Entity as OrderEntity, Model as OrderModel, OrderStatus, PaymentMethod,
        PaymentStatus,
    },
    entities::order_item::{self, Entity as OrderItemEntity, Model as OrderItemModel},
    entities::product::{self, Entity as ProductEntity},
    errors::ServiceError,
    events::{Event, EventSender},
    services::commerce::cart_service::find_cart,
    services::commerce::pricing_service::{calculate_cart_total, PricingService},
};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection,
    DatabaseTransaction, EntityTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::{Validate, ValidationError};

static POSTAL_CODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{4,10}$").unwrap());

fn not_blank(value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::new("blank"));
    }
    Ok(())
}

fn street_long_enough(value: &str) -> Result<(), ValidationError> {
    if value.trim().chars().count() < 5 {
        let mut err = ValidationError::new("street_too_short");
        err.message = Some("Street must be at least 5 characters".into());
        return Err(err);
    }
    Ok(())
}

/// Shipping destination captured at checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct ShippingAddress {
    #[validate(custom = "street_long_enough")]
    pub street: String,
    #[validate(custom = "not_blank")]
    pub city: String,
    #[validate(custom = "not_blank")]
    pub state: String,
    #[validate(regex(path = "POSTAL_CODE", message = "Postal code must be 4 to 10 digits"))]
    pub postal_code: String,
    #[validate(custom = "not_blank")]
    pub country: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct OrderLineInput {
    pub product_id: Uuid,
    #[validate(range(min = 1, message = "Quantity must be at least 1"))]
    pub quantity: i32,
    pub price_at_purchase: Decimal,
}

/// A frozen cart submitted for materialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct CreateOrderRequest {
    pub cart_id: Uuid,
    #[validate]
    pub shipping_address: ShippingAddress,
    pub payment_method: PaymentMethod,
    #[validate]
    pub items: Vec<OrderLineInput>,
    pub subtotal: Decimal,
    pub shipping_cost: Decimal,
    pub tax_amount: Decimal,
    pub total_amount: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateOrderStatusRequest {
    pub status: OrderStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderItemResponse {
    pub id: Uuid,
    pub product_id: Uuid,
    pub product_name: String,
    pub quantity: i32,
    pub price_at_purchase: Decimal,
    pub subtotal: Decimal,
}

impl From<OrderItemModel> for OrderItemResponse {
    fn from(item: OrderItemModel) -> Self {
        Self {
            id: item.id,
            product_id: item.product_id,
            product_name: item.product_name,
            subtotal: item.price_at_purchase * Decimal::from(item.quantity),
            quantity: item.quantity,
            price_at_purchase: item.price_at_purchase,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderResponse {
    pub id: Uuid,
    pub order_number: String,
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
    pub payment_method: PaymentMethod,
    pub shipping_address: ShippingAddress,
    pub items: Vec<OrderItemResponse>,
    pub subtotal_amount: Decimal,
    pub shipping_cost: Decimal,
    pub tax_amount: Decimal,
    pub total_amount: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OrderResponse {
    fn from_parts(order: OrderModel, items: Vec<OrderItemModel>) -> Self {
        Self {
            id: order.id,
            order_number: order.order_number,
            status: order.status,
            payment_status: order.payment_status,
            payment_method: order.payment_method,
            shipping_address: ShippingAddress {
                street: order.shipping_street,
                city: order.shipping_city,
                state: order.shipping_state,
                postal_code: order.shipping_postal_code,
                country: order.shipping_country,
            },
            items: items.into_iter().map(OrderItemResponse::from).collect(),
            subtotal_amount: order.subtotal_amount,
            shipping_cost: order.shipping_cost,
            tax_amount: order.tax_amount,
            total_amount: order.total_amount,
            created_at: order.created_at,
            updated_at: order.updated_at,
        }
    }
}

/// `ORD-` followed by the first eight hex digits of the order id.
pub fn order_number_for(order_id: Uuid) -> String {
    format!("ORD-{}", &order_id.simple().to_string()[..8]).to_uppercase()
}

const ORDER_NUMBER_ATTEMPTS: usize = 8;

/// Draws order ids until one yields an order number not already taken.
///
/// The number only carries 32 bits of the id, so a collision with an
/// existing order is rare but possible.
async fn unused_order_number<C, F>(
    conn: &C,
    mut next_id: F,
) -> Result<(Uuid, String), ServiceError>
where
    C: ConnectionTrait,
    F: FnMut() -> Uuid,
{
    for _ in 0..ORDER_NUMBER_ATTEMPTS {
        let order_id = next_id();
        let number = order_number_for(order_id);
        let taken = OrderEntity::find()
            .filter(order::Column::OrderNumber.eq(number.clone()))
            .one(conn)
            .await?
            .is_some();
        if !taken {
            return Ok((order_id, number));
        }
        warn!(order_number = %number, "order number already taken, drawing another");
    }
    Err(ServiceError::InternalError(
        "Could not allocate a unique order number".to_string(),
    ))
}

/// Turns a frozen cart into a persisted order and drives the order lifecycle.
#[derive(Clone)]
pub struct OrderService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    pricing: PricingService,
}

impl OrderService {
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

    /// Checks the submitted totals against the lines and the pricing policy.
    pub fn verify_totals(&self, request: &CreateOrderRequest) -> Result<(), ServiceError> {
        let line_sum = calculate_cart_total(
            request
                .items
                .iter()
                .map(|l| (l.price_at_purchase, l.quantity)),
        );
        if line_sum != request.subtotal {
            return Err(ServiceError::ValidationError(format!(
                "Subtotal {} does not match line items ({})",
                request.subtotal, line_sum
            )));
        }

        let quote = self.pricing.quote(request.subtotal);
        if quote.shipping_cost != request.shipping_cost {
            return Err(ServiceError::ValidationError(format!(
                "Shipping cost {} does not match policy ({})",
                request.shipping_cost, quote.shipping_cost
            )));
        }
        if quote.tax_amount != request.tax_amount {
            return Err(ServiceError::ValidationError(format!(
                "Tax amount {} does not match policy ({})",
                request.tax_amount, quote.tax_amount
            )));
        }
        if quote.total != request.total_amount {
            return Err(ServiceError::ValidationError(format!(
                "Total {} does not match subtotal + shipping + tax ({})",
                request.total_amount, quote.total
            )));
        }
        Ok(())
    }

    /// Materializes an order from a frozen cart in a single transaction.
    ///
    /// Each line must still be in the owner's cart at the same unit price,
    /// otherwise the request is rejected with `Conflict`. Stock is verified
    /// and decremented with a guarded update so concurrent checkouts cannot
    /// oversell. The live cart is left untouched.
    #[instrument(skip(self, request), fields(owner = %owner, cart_id = %request.cart_id))]
    pub async fn create_order(
        &self,
        owner: &CartOwner,
        request: CreateOrderRequest,
    ) -> Result<OrderResponse, ServiceError> {
        request.validate()?;
        if request.items.is_empty() {
            return Err(ServiceError::ValidationError(
                "Order must contain at least one item".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        if !request.items.iter().all(|l| seen.insert(l.product_id)) {
            return Err(ServiceError::ValidationError(
                "Duplicate product in order lines".to_string(),
            ));
        }
        self.verify_totals(&request)?;

        let txn = self.db.begin().await?;

        let cart = find_cart(&txn, owner)
            .await?
            .filter(|c| c.id == request.cart_id)
            .ok_or_else(|| {
                ServiceError::Conflict(format!("Cart {} is no longer available", request.cart_id))
            })?;

        let cart_prices: HashMap<Uuid, Decimal> = CartItem::find()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .all(&txn)
            .await?
            .into_iter()
            .map(|i| (i.product_id, i.price_at_addition))
            .collect();

        let now = Utc::now();
        let (order_id, order_number) = unused_order_number(&txn, Uuid::new_v4).await?;
        let mut names = HashMap::with_capacity(request.items.len());

        for line in &request.items {
            match cart_prices.get(&line.product_id) {
                Some(price) if *price == line.price_at_purchase => {}
                Some(_) => {
                    return Err(ServiceError::Conflict(format!(
                        "Price of product {} changed since checkout started",
                        line.product_id
                    )))
                }
                None => {
                    return Err(ServiceError::Conflict(format!(
                        "Product {} is no longer in the cart",
                        line.product_id
                    )))
                }
            }

            let product = ProductEntity::find_by_id(line.product_id)
                .one(&txn)
                .await?
                .ok_or_else(|| {
                    ServiceError::NotFound(format!("Product {} not found", line.product_id))
                })?;

            let result = ProductEntity::update_many()
                .col_expr(
                    product::Column::Stock,
                    Expr::col(product::Column::Stock).sub(line.quantity),
                )
                .col_expr(product::Column::UpdatedAt, Expr::value(now))
                .filter(product::Column::Id.eq(product.id))
                .filter(product::Column::Stock.gte(line.quantity))
                .exec(&txn)
                .await?;
            if result.rows_affected == 0 {
                warn!(product_id = %product.id, requested = line.quantity, "insufficient stock at checkout");
                return Err(ServiceError::InsufficientStock(format!(
                    "Only {} of {} in stock",
                    product.stock, product.name
                )));
            }

            names.insert(product.id, product.name);
        }

        let address = &request.shipping_address;
        order::ActiveModel {
            id: Set(order_id),
            order_number: Set(order_number),
            customer_id: Set(owner.user_id()),
            session_id: Set(owner.session_id().map(str::to_string)),
            status: Set(OrderStatus::Pending),
            payment_status: Set(PaymentStatus::Pending),
            payment_method: Set(request.payment_method),
            shipping_street: Set(address.street.trim().to_string()),
            shipping_city: Set(address.city.trim().to_string()),
            shipping_state: Set(address.state.trim().to_string()),
            shipping_postal_code: Set(address.postal_code.clone()),
            shipping_country: Set(address.country.trim().to_string()),
            subtotal_amount: Set(request.subtotal),
            shipping_cost: Set(request.shipping_cost),
            tax_amount: Set(request.tax_amount),
            total_amount: Set(request.total_amount),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await?;

        for line in &request.items {
            order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                product_id: Set(line.product_id),
                product_name: Set(names.remove(&line.product_id).unwrap_or_default()),
                quantity: Set(line.quantity),
                price_at_purchase: Set(line.price_at_purchase),
                created_at: Set(now),
            }
            .insert(&txn)
            .await?;
        }

        let response = load_order(&txn, order_id).await?;
        txn.commit().await?;

        info!(order_id = %order_id, order_number = %response.order_number, "Order created successfully");
        self.event_sender
            .send_or_log(Event::OrderCreated(order_id))
            .await;

        Ok(response)
    }

    /// Orders placed by `owner`, newest first.
    #[instrument(skip(self))]
    pub async fn list_orders(&self, owner: &CartOwner) -> Result<Vec<OrderResponse>, ServiceError> {
        let query = match owner {
            CartOwner::User(id) => OrderEntity::find().filter(order::Column::CustomerId.eq(*id)),
            CartOwner::Guest(token) => {
                OrderEntity::find().filter(order::Column::SessionId.eq(token.clone()))
            }
        };

        let orders = query
            .order_by_desc(order::Column::CreatedAt)
            .find_with_related(OrderItemEntity)
            .all(&*self.db)
            .await?;

        Ok(orders
            .into_iter()
            .map(|(order, items)| OrderResponse::from_parts(order, items))
            .collect())
    }

    /// Fetches one order. Orders owned by someone else read as missing.
    #[instrument(skip(self))]
    pub async fn get_order(
        &self,
        owner: &CartOwner,
        order_id: Uuid,
    ) -> Result<OrderResponse, ServiceError> {
        let order = find_owned_order(&*self.db, owner, order_id).await?;
        let items = order_items(&*self.db, order.id).await?;
        Ok(OrderResponse::from_parts(order, items))
    }

    /// Lets an owner cancel their own order.
    ///
    /// Cancelling is the only transition a customer may drive; anything else
    /// is refused with `Forbidden`. Fulfillment moves go through
    /// [`OrderService::transition_status`].
    #[instrument(skip(self), fields(order_id = %order_id, new_status = %new_status))]
    pub async fn update_status(
        &self,
        owner: &CartOwner,
        order_id: Uuid,
        new_status: OrderStatus,
    ) -> Result<OrderResponse, ServiceError> {
        let txn = self.db.begin().await?;
        let order = find_owned_order(&txn, owner, order_id).await?;
        if new_status != OrderStatus::Cancelled {
            return Err(ServiceError::Forbidden(format!(
                "Customers may only cancel orders, not move them to {}",
                new_status
            )));
        }
        self.apply_transition(txn, order, new_status).await
    }

    /// Moves an order along its lifecycle on behalf of fulfillment.
    ///
    /// Not routed over HTTP. Delivery marks the payment as paid and a refund
    /// marks it refunded.
    #[instrument(skip(self), fields(order_id = %order_id, new_status = %new_status))]
    pub async fn transition_status(
        &self,
        order_id: Uuid,
        new_status: OrderStatus,
    ) -> Result<OrderResponse, ServiceError> {
        let txn = self.db.begin().await?;
        let order = OrderEntity::find_by_id(order_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;
        self.apply_transition(txn, order, new_status).await
    }

    /// Cancelling puts the ordered quantities back into stock.
    async fn apply_transition(
        &self,
        txn: DatabaseTransaction,
        order: OrderModel,
        new_status: OrderStatus,
    ) -> Result<OrderResponse, ServiceError> {
        let order_id = order.id;
        let old_status = order.status;
        if !old_status.can_transition_to(new_status) {
            return Err(ServiceError::InvalidStatus(format!(
                "Cannot move order from {} to {}",
                old_status, new_status
            )));
        }

        let now = Utc::now();
        if new_status == OrderStatus::Cancelled {
            for item in order_items(&txn, order.id).await? {
                ProductEntity::update_many()
                    .col_expr(
                        product::Column::Stock,
                        Expr::col(product::Column::Stock).add(item.quantity),
                    )
                    .col_expr(product::Column::UpdatedAt, Expr::value(now))
                    .filter(product::Column::Id.eq(item.product_id))
                    .exec(&txn)
                    .await?;
            }
        }

        let payment_status = match new_status {
            OrderStatus::Delivered => PaymentStatus::Paid,
            OrderStatus::Refunded => PaymentStatus::Refunded,
            _ => order.payment_status,
        };

        let mut active: order::ActiveModel = order.into();
        active.status = Set(new_status);
        active.payment_status = Set(payment_status);
        active.updated_at = Set(now);
        active.update(&txn).await?;

        let response = load_order(&txn, order_id).await?;
        txn.commit().await?;

        info!(order_id = %order_id, old_status = %old_status, new_status = %new_status, "Order status updated successfully");
        self.event_sender
            .send_or_log(Event::OrderStatusChanged {
                order_id,
                old_status: old_status.to_string(),
                new_status: new_status.to_string(),
            })
            .await;

        Ok(response)
    }
}

async fn find_owned_order<C: ConnectionTrait>(
    conn: &C,
    owner: &CartOwner,
    order_id: Uuid,
) -> Result<OrderModel, ServiceError> {
    let order = OrderEntity::find_by_id(order_id).one(conn).await?;
    let owned = order.filter(|o| match owner {
        CartOwner::User(id) => o.customer_id == Some(*id),
        CartOwner::Guest(token) => o.session_id.as_deref() == Some(token.as_str()),
    });
    owned.ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))
}

async fn order_items<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
) -> Result<Vec<OrderItemModel>, ServiceError> {
    Ok(OrderItemEntity::find()
        .filter(order_item::Column::OrderId.eq(order_id))
        .order_by_asc(order_item::Column::CreatedAt)
        .order_by_asc(order_item::Column::Id)
        .all(conn)
        .await?)
}

async fn load_order<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
) -> Result<OrderResponse, ServiceError> {
    let order = OrderEntity::find_by_id(order_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;
    let items = order_items(conn, order_id).await?;
    Ok(OrderResponse::from_parts(order, items))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PricingConfig;
    use crate::db::{establish_connection, run_migrations};
    use crate::events;
    use crate::services::commerce::cart_service::{AddToCartInput, CartService, CartView};
    use rust_decimal_macros::dec;

    struct Fixture {
        carts: CartService,
        orders: OrderService,
        db: Arc<DatabaseConnection>,
    }

    async fn setup() -> Fixture {
        let db = establish_connection("sqlite::memory:").await.unwrap();
        run_migrations(&db).await.unwrap();
        let db = Arc::new(db);
        let (sender, rx) = events::channel(64);
        tokio::spawn(events::process_events(rx));
        let sender = Arc::new(sender);
        let pricing = PricingService::new(PricingConfig::default());
        Fixture {
            carts: CartService::new(db.clone(), sender.clone(), pricing.clone()),
            orders: OrderService::new(db.clone(), sender, pricing),
            db,
        }
    }

    async fn product(db: &DatabaseConnection, sku: &str, price: Decimal, stock: i32) -> Uuid {
        let now = Utc::now();
        product::ActiveModel {
            id: Set(Uuid::new_v4()),
            sku: Set(sku.to_string()),
            name: Set(format!("Product {}", sku)),
            description: Set(None),
            price: Set(price),
            stock: Set(stock),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(db)
        .await
        .unwrap()
        .id
    }

    async fn stock_of(db: &DatabaseConnection, id: Uuid) -> i32 {
        ProductEntity::find_by_id(id)
            .one(db)
            .await
            .unwrap()
            .unwrap()
            .stock
    }

    fn address() -> ShippingAddress {
        ShippingAddress {
            street: "12 Market Street".into(),
            city: "Springfield".into(),
            state: "IL".into(),
            postal_code: "62701".into(),
            country: "US".into(),
        }
    }

    fn request_from(view: &CartView) -> CreateOrderRequest {
        CreateOrderRequest {
            cart_id: view.cart_id.unwrap(),
            shipping_address: address(),
            payment_method: PaymentMethod::CreditCard,
            items: view
                .items
                .iter()
                .map(|l| OrderLineInput {
                    product_id: l.product_id,
                    quantity: l.quantity,
                    price_at_purchase: l.price_at_addition,
                })
                .collect(),
            subtotal: view.subtotal,
            shipping_cost: view.shipping_cost,
            tax_amount: view.tax_amount,
            total_amount: view.total,
        }
    }

    #[test]
    fn order_number_format() {
        let id = Uuid::parse_str("3f2a9c1e-0000-4000-8000-000000000000").unwrap();
        assert_eq!(order_number_for(id), "ORD-3F2A9C1E");
    }

    #[test]
    fn address_validation() {
        assert!(address().validate().is_ok());

        let mut short = address();
        short.street = "  1 A ".into();
        assert!(short.validate().is_err());

        let mut postal = address();
        postal.postal_code = "12a45".into();
        assert!(postal.validate().is_err());

        let mut blank = address();
        blank.city = "   ".into();
        assert!(blank.validate().is_err());
    }

    #[tokio::test]
    async fn creates_order_and_decrements_stock() {
        let f = setup().await;
        let owner = CartOwner::Guest("buyer".into());
        let id = product(&f.db, "MUG", dec!(10.00), 5).await;
        let view = f
            .carts
            .add_item(&owner, AddToCartInput { product_id: id, quantity: 3 })
            .await
            .unwrap();

        let order = f.orders.create_order(&owner, request_from(&view)).await.unwrap();

        assert!(order.order_number.starts_with("ORD-"));
        assert_eq!(order.order_number.len(), 12);
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.total_amount, dec!(40.00));
        assert_eq!(order.items.len(), 1);
        assert_eq!(stock_of(&f.db, id).await, 2);

        let fetched = f.orders.get_order(&owner, order.id).await.unwrap();
        assert_eq!(fetched.id, order.id);
        assert!(matches!(
            f.orders
                .get_order(&CartOwner::Guest("someone-else".into()), order.id)
                .await,
            Err(ServiceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn mismatched_totals_are_rejected() {
        let f = setup().await;
        let owner = CartOwner::Guest("buyer".into());
        let id = product(&f.db, "MUG", dec!(10.00), 5).await;
        let view = f
            .carts
            .add_item(&owner, AddToCartInput { product_id: id, quantity: 1 })
            .await
            .unwrap();

        let mut request = request_from(&view);
        request.total_amount += dec!(1.00);
        assert!(matches!(
            f.orders.create_order(&owner, request).await,
            Err(ServiceError::ValidationError(_))
        ));
        assert_eq!(stock_of(&f.db, id).await, 5);
    }

    #[tokio::test]
    async fn stale_price_is_a_conflict() {
        let f = setup().await;
        let owner = CartOwner::Guest("buyer".into());
        let id = product(&f.db, "MUG", dec!(10.00), 5).await;
        let view = f
            .carts
            .add_item(&owner, AddToCartInput { product_id: id, quantity: 1 })
            .await
            .unwrap();

        let mut request = request_from(&view);
        request.items[0].price_at_purchase = dec!(9.00);
        request.subtotal = dec!(9.00);
        request.total_amount = dec!(19.00);
        assert!(matches!(
            f.orders.create_order(&owner, request).await,
            Err(ServiceError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn oversell_rolls_back_everything() {
        let f = setup().await;
        let owner = CartOwner::Guest("buyer".into());
        let a = product(&f.db, "A", dec!(5.00), 5).await;
        let b = product(&f.db, "B", dec!(5.00), 2).await;
        f.carts
            .add_item(&owner, AddToCartInput { product_id: a, quantity: 2 })
            .await
            .unwrap();
        let view = f
            .carts
            .add_item(&owner, AddToCartInput { product_id: b, quantity: 2 })
            .await
            .unwrap();

        let mut p: product::ActiveModel = ProductEntity::find_by_id(b)
            .one(&*f.db)
            .await
            .unwrap()
            .unwrap()
            .into();
        p.stock = Set(1);
        p.update(&*f.db).await.unwrap();

        assert!(matches!(
            f.orders.create_order(&owner, request_from(&view)).await,
            Err(ServiceError::InsufficientStock(_))
        ));
        assert_eq!(stock_of(&f.db, a).await, 5);
        assert!(f.orders.list_orders(&owner).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn lifecycle_updates_payment_and_stock() {
        let f = setup().await;
        let owner = CartOwner::User(Uuid::new_v4());
        let id = product(&f.db, "MUG", dec!(10.00), 5).await;
        let view = f
            .carts
            .add_item(&owner, AddToCartInput { product_id: id, quantity: 2 })
            .await
            .unwrap();
        let order = f.orders.create_order(&owner, request_from(&view)).await.unwrap();
        assert_eq!(stock_of(&f.db, id).await, 3);

        assert!(matches!(
            f.orders
                .transition_status(order.id, OrderStatus::Delivered)
                .await,
            Err(ServiceError::InvalidStatus(_))
        ));

        let cancelled = f
            .orders
            .update_status(&owner, order.id, OrderStatus::Cancelled)
            .await
            .unwrap();
        assert_eq!(cancelled.status, OrderStatus::Cancelled);
        assert_eq!(stock_of(&f.db, id).await, 5);

        let view = f.carts.get_cart(&owner).await.unwrap();
        let second = f.orders.create_order(&owner, request_from(&view)).await.unwrap();
        for status in [
            OrderStatus::Processing,
            OrderStatus::Shipped,
            OrderStatus::Delivered,
        ] {
            f.orders.transition_status(second.id, status).await.unwrap();
        }
        let delivered = f.orders.get_order(&owner, second.id).await.unwrap();
        assert_eq!(delivered.payment_status, PaymentStatus::Paid);

        let refunded = f
            .orders
            .transition_status(second.id, OrderStatus::Refunded)
            .await
            .unwrap();
        assert_eq!(refunded.payment_status, PaymentStatus::Refunded);
        assert_eq!(f.orders.list_orders(&owner).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn owner_cannot_fulfil_or_pay_own_order() {
        let f = setup().await;
        let owner = CartOwner::Guest("buyer".into());
        let id = product(&f.db, "MUG", dec!(10.00), 5).await;
        let view = f
            .carts
            .add_item(&owner, AddToCartInput { product_id: id, quantity: 1 })
            .await
            .unwrap();
        let order = f.orders.create_order(&owner, request_from(&view)).await.unwrap();

        for status in [
            OrderStatus::Processing,
            OrderStatus::Shipped,
            OrderStatus::Delivered,
            OrderStatus::Refunded,
        ] {
            assert!(matches!(
                f.orders.update_status(&owner, order.id, status).await,
                Err(ServiceError::Forbidden(_))
            ));
        }

        let unchanged = f.orders.get_order(&owner, order.id).await.unwrap();
        assert_eq!(unchanged.status, OrderStatus::Pending);
        assert_eq!(unchanged.payment_status, PaymentStatus::Pending);

        f.orders.transition_status(order.id, OrderStatus::Processing).await.unwrap();
        let cancelled = f
            .orders
            .update_status(&owner, order.id, OrderStatus::Cancelled)
            .await
            .unwrap();
        assert_eq!(cancelled.status, OrderStatus::Cancelled);
        assert_eq!(stock_of(&f.db, id).await, 5);
    }

    #[tokio::test]
    async fn taken_order_number_draws_a_new_id() {
        let f = setup().await;
        let owner = CartOwner::Guest("buyer".into());
        let id = product(&f.db, "MUG", dec!(10.00), 5).await;
        let view = f
            .carts
            .add_item(&owner, AddToCartInput { product_id: id, quantity: 1 })
            .await
            .unwrap();
        let existing = f.orders.create_order(&owner, request_from(&view)).await.unwrap();

        // Same leading eight hex digits as the existing order, different id.
        let mut clash = *existing.id.as_bytes();
        clash[15] ^= 0xff;
        let clash = Uuid::from_bytes(clash);
        let fresh = Uuid::parse_str("0badf00d-0000-4000-8000-000000000000").unwrap();
        let mut ids = vec![fresh, clash].into_iter().rev();

        let (order_id, number) = unused_order_number(&*f.db, || ids.next().unwrap())
            .await
            .unwrap();
        assert_eq!(order_id, fresh);
        assert_eq!(number, "ORD-0BADF00D");
        assert_ne!(number, existing.order_number);
    }
}
