//! Order materialization and lifecycle over HTTP.

mod common;

use axum::http::{Method, StatusCode};
use common::{guest_token, money, As, TestApp};
use rust_decimal_macros::dec;
use serde_json::{json, Value};

fn address() -> Value {
    json!({
        "street": "12 Harbour Road",
        "city": "Leith",
        "state": "Lothian",
        "postal_code": "12345",
        "country": "UK"
    })
}

/// Order payload built from a cart view exactly as a client would send it.
fn order_payload(cart: &Value, payment_method: &str) -> Value {
    let items: Vec<Value> = cart["items"]
        .as_array()
        .unwrap()
        .iter()
        .map(|l| {
            json!({
                "product_id": l["product_id"],
                "quantity": l["quantity"],
                "price_at_purchase": l["price_at_addition"],
            })
        })
        .collect();
    json!({
        "cart_id": cart["cart_id"],
        "shipping_address": address(),
        "payment_method": payment_method,
        "items": items,
        "subtotal": cart["subtotal"],
        "shipping_cost": cart["shipping_cost"],
        "tax_amount": cart["tax_amount"],
        "total_amount": cart["total"],
    })
}

async fn cart_with(app: &TestApp, guest: &str, product_id: uuid::Uuid, quantity: i32) -> Value {
    app.json(
        Method::POST,
        "/api/cart/items",
        Some(json!({ "product_id": product_id, "quantity": quantity })),
        As::Guest(guest),
        StatusCode::OK,
    )
    .await
}

#[tokio::test]
async fn order_decrements_stock_and_is_retrievable() {
    let app = TestApp::new().await;
    let mug = app.seed_product("MUG-O1", dec!(10.00), 100).await;
    let guest = guest_token();
    let cart = cart_with(&app, &guest, mug.id, 3).await;

    let order = app
        .json(
            Method::POST,
            "/api/orders",
            Some(order_payload(&cart, "credit_card")),
            As::Guest(&guest),
            StatusCode::CREATED,
        )
        .await;

    assert!(order["order_number"].as_str().unwrap().starts_with("ORD-"));
    assert_eq!(order["status"], "pending");
    assert_eq!(order["payment_method"], "credit_card");
    assert_eq!(money(&order["total_amount"]), dec!(40.00));
    assert_eq!(order["items"][0]["quantity"], 3);
    assert_eq!(app.product_stock(mug.id).await, 97);

    let id = order["id"].as_str().unwrap();
    let fetched = app
        .json(
            Method::GET,
            &format!("/api/orders/{}", id),
            None,
            As::Guest(&guest),
            StatusCode::OK,
        )
        .await;
    assert_eq!(fetched["order_number"], order["order_number"]);

    let listed = app
        .json(Method::GET, "/api/orders", None, As::Guest(&guest), StatusCode::OK)
        .await;
    assert_eq!(listed.as_array().unwrap().len(), 1);

    app.json(
        Method::GET,
        &format!("/api/orders/{}", id),
        None,
        As::Guest(&guest_token()),
        StatusCode::NOT_FOUND,
    )
    .await;
}

#[tokio::test]
async fn stock_change_after_adding_fails_checkout_without_side_effects() {
    let app = TestApp::new().await;
    let bottle = app.seed_product("BTL-O2", dec!(25.00), 3).await;
    let first = guest_token();
    let second = guest_token();

    let first_cart = cart_with(&app, &first, bottle.id, 3).await;
    let second_cart = cart_with(&app, &second, bottle.id, 2).await;

    app.json(
        Method::POST,
        "/api/orders",
        Some(order_payload(&first_cart, "paypal")),
        As::Guest(&first),
        StatusCode::CREATED,
    )
    .await;
    assert_eq!(app.product_stock(bottle.id).await, 0);

    let err = app
        .json(
            Method::POST,
            "/api/orders",
            Some(order_payload(&second_cart, "paypal")),
            As::Guest(&second),
            StatusCode::UNPROCESSABLE_ENTITY,
        )
        .await;
    assert_eq!(err["details"], "insufficient_stock");
    assert_eq!(app.product_stock(bottle.id).await, 0);

    let listed = app
        .json(Method::GET, "/api/orders", None, As::Guest(&second), StatusCode::OK)
        .await;
    assert!(listed.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn tampered_totals_are_rejected() {
    let app = TestApp::new().await;
    let mug = app.seed_product("MUG-O3", dec!(10.00), 10).await;
    let guest = guest_token();
    let cart = cart_with(&app, &guest, mug.id, 2).await;

    let mut payload = order_payload(&cart, "debit_card");
    payload["total_amount"] = json!("1.00");
    app.json(
        Method::POST,
        "/api/orders",
        Some(payload),
        As::Guest(&guest),
        StatusCode::BAD_REQUEST,
    )
    .await;

    let mut payload = order_payload(&cart, "debit_card");
    payload["payment_method"] = json!("cash");
    let response = app
        .request(Method::POST, "/api/orders", Some(payload), As::Guest(&guest))
        .await;
    assert!(response.status().is_client_error());
    assert_eq!(app.product_stock(mug.id).await, 10);
}

#[tokio::test]
async fn cancelling_restores_stock() {
    let app = TestApp::new().await;
    let mug = app.seed_product("MUG-O4", dec!(10.00), 10).await;
    let guest = guest_token();
    let cart = cart_with(&app, &guest, mug.id, 4).await;

    let order = app
        .json(
            Method::POST,
            "/api/orders",
            Some(order_payload(&cart, "bank_transfer")),
            As::Guest(&guest),
            StatusCode::CREATED,
        )
        .await;
    let status_path = format!("/api/orders/{}/status", order["id"].as_str().unwrap());
    assert_eq!(app.product_stock(mug.id).await, 6);

    let cancelled = app
        .json(
            Method::PATCH,
            &status_path,
            Some(json!({ "status": "cancelled" })),
            As::Guest(&guest),
            StatusCode::OK,
        )
        .await;
    assert_eq!(cancelled["status"], "cancelled");
    assert_eq!(app.product_stock(mug.id).await, 10);

    app.json(
        Method::PATCH,
        &status_path,
        Some(json!({ "status": "cancelled" })),
        As::Guest(&guest),
        StatusCode::BAD_REQUEST,
    )
    .await;
    assert_eq!(app.product_stock(mug.id).await, 10);
}

#[tokio::test]
async fn guest_cannot_ship_deliver_or_refund_own_order() {
    let app = TestApp::new().await;
    let mug = app.seed_product("MUG-O5", dec!(10.00), 10).await;
    let guest = guest_token();
    let cart = cart_with(&app, &guest, mug.id, 2).await;

    let order = app
        .json(
            Method::POST,
            "/api/orders",
            Some(order_payload(&cart, "credit_card")),
            As::Guest(&guest),
            StatusCode::CREATED,
        )
        .await;
    let order_path = format!("/api/orders/{}", order["id"].as_str().unwrap());
    let status_path = format!("{}/status", order_path);

    for status in ["processing", "shipped", "delivered", "refunded"] {
        app.json(
            Method::PATCH,
            &status_path,
            Some(json!({ "status": status })),
            As::Guest(&guest),
            StatusCode::FORBIDDEN,
        )
        .await;
    }

    let unchanged = app
        .json(Method::GET, &order_path, None, As::Guest(&guest), StatusCode::OK)
        .await;
    assert_eq!(unchanged["status"], "pending");
    assert_eq!(unchanged["payment_status"], "pending");
}
