use serde::{Deserialize, Serialize};

use crate::error::PaymentError;
use crate::schema::Product;

/// A line as submitted at checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartLine {
    pub product_id: i64,
    pub quantity: i64,
}

/// A line frozen at initiation time; the sale is built from this, not from the live catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartSnapshotLine {
    pub product_id: i64,
    pub name: String,
    pub unit_price: i64,
    pub quantity: i64,
    pub line_total: i64,
}

impl CartSnapshotLine {
    pub fn from_product(product: &Product, quantity: i64) -> Result<Self, PaymentError> {
        let line_total = product.price.checked_mul(quantity).ok_or_else(|| {
            PaymentError::Validation(format!("Line total overflows for product {}", product.id))
        })?;
        Ok(CartSnapshotLine {
            product_id: product.id,
            name: product.name.clone(),
            unit_price: product.price,
            quantity,
            line_total,
        })
    }
}

pub fn cart_total(lines: &[CartSnapshotLine]) -> i64 {
    lines.iter().map(|l| l.line_total).sum()
}

/// Rejects empty carts and non-positive quantities before any lookup happens.
pub fn validate_cart(cart: &[CartLine]) -> Result<(), PaymentError> {
    if cart.is_empty() {
        return Err(PaymentError::Validation("Cart must not be empty".to_string()));
    }
    if let Some(line) = cart.iter().find(|l| l.quantity <= 0) {
        return Err(PaymentError::Validation(format!(
            "Quantity for product {} must be greater than zero",
            line.product_id
        )));
    }
    Ok(())
}
