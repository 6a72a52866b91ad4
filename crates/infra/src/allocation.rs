//! Stock allocation against live inventory.
//!
//! The ranking and greedy split live in `pickline_inventory::allocation`; this
//! module feeds them candidate rows read through an `InventoryTx`, expands
//! package products, and tracks quantities already promised to earlier items of
//! the same batch.

use std::collections::HashMap;

use thiserror::Error;
use tracing::debug;

use pickline_core::{LocationId, ProductId};
use pickline_inventory::{
    AllocationError, Demand, PackageComponent, Pick, Product, StockCandidate, expand_package,
    resolve,
};

use crate::inventory_store::{InventoryTx, LockMode, StoreError};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error(transparent)]
    Allocation(#[from] AllocationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("product {0} not found")]
    UnknownProduct(ProductId),
}

/// Picks for one concrete product of a (possibly expanded) demand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentPicks {
    pub demand: Demand,
    pub picks: Vec<Pick>,
}

impl ComponentPicks {
    pub fn is_fully_allocated(&self) -> bool {
        self.picks.iter().all(|p| !p.is_backorder())
    }

    pub fn backorder(&self) -> i64 {
        pickline_inventory::backorder_quantity(&self.picks)
    }
}

/// Quantities already planned against stock rows within one transaction.
#[derive(Debug, Clone, Default)]
pub struct Reservations {
    held: HashMap<(ProductId, LocationId), i64>,
}

impl Reservations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reserve(&mut self, product_id: ProductId, location_id: LocationId, quantity: i64) {
        *self.held.entry((product_id, location_id)).or_insert(0) += quantity;
    }

    pub fn reserved(&self, product_id: ProductId, location_id: LocationId) -> i64 {
        self.held.get(&(product_id, location_id)).copied().unwrap_or(0)
    }

    /// Candidates with reserved quantities taken off.
    fn apply(&self, product_id: ProductId, candidates: Vec<StockCandidate>) -> Vec<StockCandidate> {
        candidates
            .into_iter()
            .map(|mut c| {
                c.quantity -= self.reserved(product_id, c.location_id);
                c
            })
            .collect()
    }
}

/// Resolves demand into location picks against an open transaction.
#[derive(Debug, Clone, Copy, Default)]
pub struct StockAllocationEngine;

impl StockAllocationEngine {
    pub fn new() -> Self {
        Self
    }

    /// Resolve `quantity` of a single (non-expanded) product without locking.
    pub async fn resolve<T: InventoryTx>(
        &self,
        tx: &mut T,
        product_id: ProductId,
        quantity: i64,
    ) -> Result<Vec<Pick>, EngineError> {
        let candidates = tx.stock_candidates(product_id, LockMode::Shared).await?;
        Ok(resolve(&candidates, quantity)?)
    }

    /// Resolve under row locks, net of what `reserved` already holds.
    pub async fn resolve_locked<T: InventoryTx>(
        &self,
        tx: &mut T,
        product_id: ProductId,
        quantity: i64,
        reserved: &Reservations,
    ) -> Result<Vec<Pick>, EngineError> {
        let candidates = tx.stock_candidates(product_id, LockMode::ForUpdate).await?;
        let candidates = reserved.apply(product_id, candidates);
        Ok(resolve(&candidates, quantity)?)
    }

    /// Expand `product` and resolve each resulting demand.
    ///
    /// `components` are the package's components (ignored for plain products).
    pub async fn plan<T: InventoryTx>(
        &self,
        tx: &mut T,
        product: &Product,
        quantity: i64,
        components: &[PackageComponent],
    ) -> Result<Vec<ComponentPicks>, EngineError> {
        let demands = expand_package(product, quantity, components)?;
        let mut planned = Vec::with_capacity(demands.len());
        for demand in demands {
            let picks = self.resolve(tx, demand.product_id, demand.quantity).await?;
            planned.push(ComponentPicks { demand, picks });
        }
        debug!(sku = %product.sku, quantity, components = planned.len(), "planned picks");
        Ok(planned)
    }

    /// Same as `plan`, but locking rows and honouring `reserved`. Picks are
    /// added to `reserved` as they are made.
    pub async fn plan_locked<T: InventoryTx>(
        &self,
        tx: &mut T,
        product: &Product,
        quantity: i64,
        components: &[PackageComponent],
        reserved: &mut Reservations,
    ) -> Result<Vec<ComponentPicks>, EngineError> {
        let demands = expand_package(product, quantity, components)?;
        let mut planned = Vec::with_capacity(demands.len());
        for demand in demands {
            let picks = self
                .resolve_locked(tx, demand.product_id, demand.quantity, reserved)
                .await?;
            for pick in &picks {
                if let Some(location_id) = pick.location_id {
                    reserved.reserve(demand.product_id, location_id, pick.quantity);
                }
            }
            planned.push(ComponentPicks { demand, picks });
        }
        Ok(planned)
    }

    /// Load a product (and its components) by id, then `plan`.
    pub async fn resolve_product<T: InventoryTx>(
        &self,
        tx: &mut T,
        product_id: ProductId,
        quantity: i64,
    ) -> Result<Vec<ComponentPicks>, EngineError> {
        let product = tx
            .product(product_id)
            .await?
            .ok_or(EngineError::UnknownProduct(product_id))?;
        let components = load_components(tx, &product).await?;
        self.plan(tx, &product, quantity, &components).await
    }
}

/// Components of `product`, or nothing for a plain product.
pub(crate) async fn load_components<T: InventoryTx>(
    tx: &mut T,
    product: &Product,
) -> Result<Vec<PackageComponent>, StoreError> {
    if !product.is_package {
        return Ok(Vec::new());
    }
    let mut by_package = tx.package_components(&[product.id]).await?;
    Ok(by_package.remove(&product.id).unwrap_or_default())
}
