//! Seed data script - populates the catalog with a small demo assortment
//!
//! Run with: cargo run --bin seed-data
//!
//! Uses the same configuration as the server (`config/`, `APP__*`), runs
//! pending migrations and inserts products whose SKU is not present yet.

use anyhow::Context;
use clap::Parser;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::{path::PathBuf, sync::Arc};
use tracing::{info, warn};

use cartflow_api::{
    config, db,
    errors::ServiceError,
    events,
    services::commerce::{CreateProductInput, ProductService},
};

#[derive(Parser)]
#[command(name = "seed-data", about = "Insert the demo catalog", version)]
struct Cli {
    #[arg(long, help = "Directory holding default.toml and per-environment files")]
    config_dir: Option<PathBuf>,

    #[arg(long, help = "Log what would be created without writing anything")]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = match &cli.config_dir {
        Some(dir) => config::load_config_from(dir),
        None => config::load_config(),
    }
    .context("failed to load configuration")?;
    config::init_tracing(cfg.log_level(), cfg.log_json);

    info!("=== Cartflow Seed Data ===");

    if cli.dry_run {
        for (sku, name, price, stock, _) in catalog() {
            info!("  Would create {} ({}) at {} with stock {}", name, sku, price, stock);
        }
        return Ok(());
    }

    let pool = db::establish_connection_from_app_config(&cfg).await?;
    db::run_migrations(&pool).await?;

    let (event_sender, event_rx) = events::channel(cfg.event_channel_capacity);
    let event_task = tokio::spawn(events::process_events(event_rx));
    let products = ProductService::new(Arc::new(pool), Arc::new(event_sender));

    let mut created = 0;
    for (sku, name, price, stock, description) in catalog() {
        let input = CreateProductInput {
            sku: sku.to_string(),
            name: name.to_string(),
            description: Some(description.to_string()),
            price,
            stock,
        };
        match products.create_product(input).await {
            Ok(product) => {
                info!("  Created {} ({})", product.name, product.sku);
                created += 1;
            }
            Err(ServiceError::Conflict(_)) => info!("  Skipped {}: already present", sku),
            Err(e) => warn!("  Failed to create {}: {}", sku, e),
        }
    }

    drop(products);
    let _ = event_task.await;

    info!("=== Seed Data Complete: {} products created ===", created);
    info!("Try: curl http://{}:{}/api/products", cfg.host, cfg.port);
    Ok(())
}

fn catalog() -> Vec<(&'static str, &'static str, Decimal, i32, &'static str)> {
    vec![
        ("WBH-001", "Wireless Bluetooth Headphones", dec!(79.99), 25, "Over-ear headphones with 30-hour battery life."),
        ("CHG-065", "USB-C Fast Charger 65W", dec!(34.99), 40, "GaN charger for laptops, phones and tablets."),
        ("TSH-BLK-M", "Classic Cotton T-Shirt", dec!(24.99), 60, "Organic cotton t-shirt, regular fit."),
        ("MUG-CER", "Ceramic Coffee Mug", dec!(10.00), 100, "12oz stoneware mug."),
        ("WLT-LTH", "Leather Bifold Wallet", dec!(49.99), 15, "Genuine leather wallet with RFID blocking."),
        ("BTL-SS-32", "Stainless Steel Water Bottle", dec!(29.99), 3, "32oz double-wall insulated bottle."),
        ("LMP-DSK", "Desk Lamp", dec!(39.50), 0, "Adjustable LED desk lamp. Currently out of stock."),
    ]
}

