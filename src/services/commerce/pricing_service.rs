use crate::config::PricingConfig;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Money breakdown of a cart or order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartTotals {
    pub subtotal: Decimal,
    pub shipping_cost: Decimal,
    pub tax_amount: Decimal,
    pub total: Decimal,
}

/// Sum of `unit price × quantity` over the given lines. Empty input is zero.
pub fn calculate_cart_total<I>(lines: I) -> Decimal
where
    I: IntoIterator<Item = (Decimal, i32)>,
{
    lines
        .into_iter()
        .map(|(price, quantity)| price * Decimal::from(quantity))
        .sum()
}

/// Applies the configured shipping and tax policy to a cart subtotal.
#[derive(Debug, Clone)]
pub struct PricingService {
    config: PricingConfig,
}

impl PricingService {
    pub fn new(config: PricingConfig) -> Self {
        Self { config }
    }

    /// Free at or above the threshold, flat rate below it, nothing for an
    /// empty cart.
    pub fn shipping_for(&self, subtotal: Decimal) -> Decimal {
        if subtotal <= Decimal::ZERO || subtotal >= self.config.free_shipping_threshold {
            Decimal::ZERO
        } else {
            self.config.flat_shipping_rate
        }
    }

    /// Tax on the subtotal, rounded to cents.
    pub fn tax_for(&self, subtotal: Decimal) -> Decimal {
        (subtotal * self.config.tax_rate).round_dp(2)
    }

    pub fn quote(&self, subtotal: Decimal) -> CartTotals {
        let shipping_cost = self.shipping_for(subtotal);
        let tax_amount = self.tax_for(subtotal);
        CartTotals {
            subtotal,
            shipping_cost,
            tax_amount,
            total: subtotal + shipping_cost + tax_amount,
        }
    }
}
