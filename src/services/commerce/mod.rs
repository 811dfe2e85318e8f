/// Commerce services module - cart store, catalog and pricing policy
pub mod cart_service;
pub mod pricing_service;
pub mod product_service;

// Re-export services for convenience
pub use cart_service::{
    AddToCartInput, CartLineView, CartService, CartView, MergeAdjustment, MergeOutcome,
};
pub use pricing_service::{calculate_cart_total, CartTotals, PricingService};
pub use product_service::{CreateProductInput, ProductSearchQuery, ProductService};
