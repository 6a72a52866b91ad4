use serde::{Deserialize, Serialize};

use pickline_core::ProductId;

/// Catalog product.
///
/// A package product (`is_package`) is sold under its own SKU but fulfilled by
/// picking its components.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    pub sku: String,
    pub name: String,
    /// Price in smallest currency unit (e.g., cents).
    pub price_cents: i64,
    pub is_active: bool,
    pub is_package: bool,
}

impl Product {
    /// Stock value of `quantity` units at the catalog price.
    pub fn value_of(&self, quantity: i64) -> i64 {
        self.price_cents.saturating_mul(quantity)
    }
}

/// One component line of a package product.
///
/// Carries the component's SKU and package flag as joined from the component's
/// own product row, so expansion can be checked without another lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageComponent {
    pub package_product_id: ProductId,
    pub component_product_id: ProductId,
    pub component_sku: String,
    pub component_is_package: bool,
    pub quantity_per_package: i64,
}
