//! Stock allocation: turning a (product, quantity) demand into location picks.
//!
//! ## Ranking
//!
//! Candidates are ranked into four tiers (lower is preferred):
//!
//! | tier | condition |
//! |------|-----------|
//! | 1 | preferred floor (1 or 2) and can satisfy the whole demand |
//! | 2 | can satisfy the whole demand from any floor |
//! | 3 | preferred floor, partial only |
//! | 4 | everything else |
//!
//! Within a tier the larger stock row wins, then the lower location id.
//! Picks are consumed greedily in that order; anything left over becomes a
//! single backorder pick with no location.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use pickline_core::{LocationId, ProductId};

use crate::location::LocationPurpose;
use crate::product::{PackageComponent, Product};

/// Floors that pickers reach first.
pub const PREFERRED_FLOORS: [i32; 2] = [1, 2];

/// Supported package nesting: a package expands once into plain products.
pub const MAX_PACKAGE_DEPTH: usize = 1;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AllocationError {
    #[error("requested quantity must be positive (got {0})")]
    NonPositiveQuantity(i64),

    #[error("package {sku} lists itself as a component")]
    SelfReference { sku: String },

    #[error("package {package_sku} contains package {component_sku}; nesting deeper than {max} level is not supported")]
    NestedPackage {
        package_sku: String,
        component_sku: String,
        max: usize,
    },

    #[error("package {package_sku} component {component_sku} has non-positive quantity {quantity}")]
    InvalidComponentQuantity {
        package_sku: String,
        component_sku: String,
        quantity: i64,
    },

    #[error("quantity overflow expanding package {sku}")]
    Overflow { sku: String },
}

/// One stock row eligible for picking, joined with its location attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockCandidate {
    pub location_id: LocationId,
    pub location_code: String,
    pub floor: i32,
    pub purpose: LocationPurpose,
    pub quantity: i64,
}

impl StockCandidate {
    fn is_eligible(&self) -> bool {
        self.quantity > 0 && self.purpose.is_pickable()
    }
}

/// A resolved slice of demand. `location_id == None` marks backorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pick {
    pub location_id: Option<LocationId>,
    pub quantity: i64,
}

impl Pick {
    pub fn at(location_id: LocationId, quantity: i64) -> Self {
        Self {
            location_id: Some(location_id),
            quantity,
        }
    }

    pub fn backorder(quantity: i64) -> Self {
        Self {
            location_id: None,
            quantity,
        }
    }

    pub fn is_backorder(&self) -> bool {
        self.location_id.is_none()
    }
}

/// Demand for a concrete (non-package) product after package expansion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Demand {
    pub product_id: ProductId,
    pub sku: String,
    pub quantity: i64,
}

/// Rank tier of a candidate for a given demand (1 = best).
pub fn rank(candidate: &StockCandidate, needed: i64) -> u8 {
    let preferred = PREFERRED_FLOORS.contains(&candidate.floor);
    let covers = candidate.quantity >= needed;
    match (preferred, covers) {
        (true, true) => 1,
        (false, true) => 2,
        (true, false) => 3,
        (false, false) => 4,
    }
}

/// Resolve `needed` units against the given candidates.
///
/// The returned picks always sum to `needed`. Ineligible candidates
/// (non-display, or no stock) are ignored.
pub fn resolve(candidates: &[StockCandidate], needed: i64) -> Result<Vec<Pick>, AllocationError> {
    if needed <= 0 {
        return Err(AllocationError::NonPositiveQuantity(needed));
    }

    let mut ranked: Vec<&StockCandidate> = candidates.iter().filter(|c| c.is_eligible()).collect();
    ranked.sort_by(|a, b| {
        rank(a, needed)
            .cmp(&rank(b, needed))
            .then_with(|| b.quantity.cmp(&a.quantity))
            .then_with(|| a.location_id.cmp(&b.location_id))
    });

    let mut remaining = needed;
    let mut picks = Vec::new();
    for candidate in ranked {
        if remaining == 0 {
            break;
        }
        let take = remaining.min(candidate.quantity);
        picks.push(Pick::at(candidate.location_id, take));
        remaining -= take;
    }

    if remaining > 0 {
        picks.push(Pick::backorder(remaining));
    }

    Ok(picks)
}

/// Sum of picks that have a location.
pub fn allocated_quantity(picks: &[Pick]) -> i64 {
    picks
        .iter()
        .filter(|p| !p.is_backorder())
        .map(|p| p.quantity)
        .sum()
}

/// Sum of backorder picks.
pub fn backorder_quantity(picks: &[Pick]) -> i64 {
    picks
        .iter()
        .filter(|p| p.is_backorder())
        .map(|p| p.quantity)
        .sum()
}

/// Expand a demand for `product` into per-component demands.
///
/// Plain products (and packages without components) come back unchanged.
/// Components that are themselves packages are rejected.
pub fn expand_package(
    product: &Product,
    quantity: i64,
    components: &[PackageComponent],
) -> Result<Vec<Demand>, AllocationError> {
    if quantity <= 0 {
        return Err(AllocationError::NonPositiveQuantity(quantity));
    }

    if !product.is_package || components.is_empty() {
        return Ok(vec![Demand {
            product_id: product.id,
            sku: product.sku.clone(),
            quantity,
        }]);
    }

    components
        .iter()
        .map(|c| {
            if c.component_product_id == product.id {
                return Err(AllocationError::SelfReference {
                    sku: product.sku.clone(),
                });
            }
            if c.component_is_package {
                return Err(AllocationError::NestedPackage {
                    package_sku: product.sku.clone(),
                    component_sku: c.component_sku.clone(),
                    max: MAX_PACKAGE_DEPTH,
                });
            }
            if c.quantity_per_package <= 0 {
                return Err(AllocationError::InvalidComponentQuantity {
                    package_sku: product.sku.clone(),
                    component_sku: c.component_sku.clone(),
                    quantity: c.quantity_per_package,
                });
            }
            let total = c
                .quantity_per_package
                .checked_mul(quantity)
                .ok_or_else(|| AllocationError::Overflow {
                    sku: product.sku.clone(),
                })?;
            Ok(Demand {
                product_id: c.component_product_id,
                sku: c.component_sku.clone(),
                quantity: total,
            })
        })
        .collect()
}
