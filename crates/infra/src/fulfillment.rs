//! Fulfillment committer: the only writer of stock rows.
//!
//! `complete_items` validates a whole batch before touching anything, then
//! deducts stock, writes one `SALE` movement per deduction, and marks the
//! items validated. Any item that cannot be fully resolved aborts the batch.

use std::collections::HashSet;

use serde::Serialize;
use thiserror::Error;
use tracing::{info, instrument, warn};

use pickline_core::{DomainError, LocationId, PickingListItemId, ProductId, UserId};
use pickline_inventory::{NewStockMovement, PickingListItem};

use crate::allocation::{EngineError, Reservations, StockAllocationEngine, load_components};
use crate::inventory_store::{InventoryStore, InventoryTx, StoreError};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FulfillmentError {
    #[error("picking item {item_id}: {reason}")]
    Validation {
        item_id: PickingListItemId,
        reason: String,
    },

    #[error("invalid stock adjustment: {0}")]
    InvalidAdjustment(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<DomainError> for FulfillmentError {
    fn from(err: DomainError) -> Self {
        FulfillmentError::InvalidAdjustment(err.to_string())
    }
}

/// One planned or applied deduction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Deduction {
    pub product_id: ProductId,
    pub sku: String,
    pub location_id: LocationId,
    pub quantity: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemResult {
    pub item_id: PickingListItemId,
    pub ok: bool,
    pub deductions: Vec<Deduction>,
    /// Location persisted by just-in-time resolution of a backorder item.
    pub resolved_location: Option<LocationId>,
    pub error: Option<String>,
}

impl ItemResult {
    fn failed(item_id: PickingListItemId, error: impl Into<String>) -> Self {
        Self {
            item_id,
            ok: false,
            deductions: Vec::new(),
            resolved_location: None,
            error: Some(error.into()),
        }
    }
}

/// Outcome of a `complete_items` batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FulfillmentReport {
    pub success: bool,
    pub items: Vec<ItemResult>,
}

impl FulfillmentReport {
    /// First failed item as an error, for callers that want `?`.
    pub fn into_result(self) -> Result<Self, FulfillmentError> {
        match self.items.iter().find(|r| !r.ok) {
            Some(failed) => Err(FulfillmentError::Validation {
                item_id: failed.item_id,
                reason: failed.error.clone().unwrap_or_default(),
            }),
            None => Ok(self),
        }
    }

    pub fn movement_count(&self) -> usize {
        self.items.iter().map(|r| r.deductions.len()).sum()
    }
}

/// Result of an absolute stock count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StockAdjustment {
    pub previous: i64,
    pub current: i64,
    /// `None` when the count matched and nothing was written.
    pub movement_id: Option<i64>,
}

struct PlannedItem {
    item: PickingListItem,
    deductions: Vec<Deduction>,
    resolved_location: Option<LocationId>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FulfillmentCommitter {
    engine: StockAllocationEngine,
}

impl FulfillmentCommitter {
    pub fn new(engine: StockAllocationEngine) -> Self {
        Self { engine }
    }

    /// Complete a batch in its own transaction.
    ///
    /// Commits only when every item validates; otherwise rolls back and
    /// returns the per-item report with `success == false`.
    #[instrument(skip(self, store, item_ids), fields(items = item_ids.len(), user_id = %user_id), err)]
    pub async fn complete_items<S: InventoryStore>(
        &self,
        store: &S,
        item_ids: &[PickingListItemId],
        user_id: UserId,
    ) -> Result<FulfillmentReport, FulfillmentError> {
        let mut tx = store.begin().await?;
        let report = match self.complete_items_in(&mut tx, item_ids, user_id).await {
            Ok(report) => report,
            Err(err) => {
                tx.rollback().await?;
                return Err(err);
            }
        };

        if report.success {
            tx.commit().await?;
            info!(movements = report.movement_count(), "fulfillment batch committed");
        } else {
            tx.rollback().await?;
            warn!("fulfillment batch rolled back");
        }
        Ok(report)
    }

    /// Validate-then-apply inside a caller-owned transaction.
    ///
    /// Nothing is written unless every item validates. On a store error the
    /// transaction may hold partial writes and must be rolled back.
    pub async fn complete_items_in<T: InventoryTx>(
        &self,
        tx: &mut T,
        item_ids: &[PickingListItemId],
        user_id: UserId,
    ) -> Result<FulfillmentReport, FulfillmentError> {
        let mut seen = HashSet::new();
        let ids: Vec<PickingListItemId> = item_ids.iter().copied().filter(|id| seen.insert(*id)).collect();

        let loaded = tx.picking_items(&ids).await?;

        // Phase 1: validate, no writes.
        let mut reserved = Reservations::new();
        let mut planned = Vec::with_capacity(ids.len());
        let mut results = Vec::with_capacity(ids.len());
        for id in &ids {
            let Some(item) = loaded.iter().find(|i| i.id == *id) else {
                results.push(ItemResult::failed(*id, "picking item not found"));
                continue;
            };
            if !item.is_pending() {
                results.push(ItemResult::failed(*id, "picking item already validated"));
                continue;
            }
            match self.validate_item(tx, item, &mut reserved).await? {
                Ok(plan) => {
                    results.push(ItemResult {
                        item_id: *id,
                        ok: true,
                        deductions: plan.deductions.clone(),
                        resolved_location: plan.resolved_location,
                        error: None,
                    });
                    planned.push(plan);
                }
                Err(reason) => results.push(ItemResult::failed(*id, reason)),
            }
        }

        if results.iter().any(|r| !r.ok) {
            return Ok(FulfillmentReport {
                success: false,
                items: results,
            });
        }

        // Phase 2: apply.
        for plan in &planned {
            if let Some(location_id) = plan.resolved_location {
                tx.set_suggested_location(plan.item.id, location_id).await?;
            }
            for deduction in &plan.deductions {
                tx.adjust_stock(deduction.product_id, deduction.location_id, -deduction.quantity)
                    .await?;
                let movement = NewStockMovement::sale(
                    deduction.product_id,
                    deduction.location_id,
                    deduction.quantity,
                    user_id,
                    plan.item.id,
                    &deduction.sku,
                )
                .map_err(|e| FulfillmentError::Validation {
                    item_id: plan.item.id,
                    reason: e.to_string(),
                })?;
                tx.record_movement(&movement).await?;
            }
            tx.mark_item_validated(plan.item.id, user_id).await?;
        }

        Ok(FulfillmentReport {
            success: true,
            items: results,
        })
    }

    /// Work out where an item's stock comes from. The outer error is a store
    /// failure; the inner one is a human-readable validation failure.
    async fn validate_item<T: InventoryTx>(
        &self,
        tx: &mut T,
        item: &PickingListItem,
        reserved: &mut Reservations,
    ) -> Result<Result<PlannedItem, String>, FulfillmentError> {
        if item.quantity <= 0 {
            return Ok(Err(format!("quantity must be positive (got {})", item.quantity)));
        }
        let Some(product) = tx.product(item.product_id).await? else {
            return Ok(Err(format!("product {} not found", item.product_id)));
        };

        // A package without components is picked as itself.
        let components = load_components(tx, &product).await?;
        let single = components.is_empty();

        // A persisted suggestion wins when its row still covers the item.
        if let (Some(location_id), true) = (item.suggested_location_id, single) {
            if let Some(on_hand) = tx.lock_stock(product.id, location_id).await? {
                if on_hand - reserved.reserved(product.id, location_id) >= item.quantity {
                    reserved.reserve(product.id, location_id, item.quantity);
                    return Ok(Ok(PlannedItem {
                        item: item.clone(),
                        deductions: vec![Deduction {
                            product_id: product.id,
                            sku: product.sku.clone(),
                            location_id,
                            quantity: item.quantity,
                        }],
                        resolved_location: None,
                    }));
                }
            }
        }

        let planned = match self
            .engine
            .plan_locked(tx, &product, item.quantity, &components, reserved)
            .await
        {
            Ok(planned) => planned,
            Err(EngineError::Store(err)) => return Err(err.into()),
            Err(err) => return Ok(Err(err.to_string())),
        };

        if let Some(short) = planned.iter().find(|c| !c.is_fully_allocated()) {
            return Ok(Err(format!(
                "insufficient stock for {}: short {} of {}",
                short.demand.sku,
                short.backorder(),
                short.demand.quantity
            )));
        }

        let deductions: Vec<Deduction> = planned
            .iter()
            .flat_map(|c| {
                c.picks.iter().filter_map(|p| {
                    Some(Deduction {
                        product_id: c.demand.product_id,
                        sku: c.demand.sku.clone(),
                        location_id: p.location_id?,
                        quantity: p.quantity,
                    })
                })
            })
            .collect();

        let own_demand = planned.len() == 1 && planned[0].demand.product_id == item.product_id;
        let resolved_location = if item.is_backorder() && own_demand {
            deductions.first().map(|d| d.location_id)
        } else {
            None
        };

        Ok(Ok(PlannedItem {
            item: item.clone(),
            deductions,
            resolved_location,
        }))
    }

    /// Set the counted quantity of a (product, location) row and record the
    /// difference as an `ADJUSTMENT` movement.
    #[instrument(skip(self, tx, notes), fields(product_id = %product_id, location_id = %location_id), err)]
    pub async fn set_quantity<T: InventoryTx>(
        &self,
        tx: &mut T,
        product_id: ProductId,
        location_id: LocationId,
        quantity: i64,
        user_id: UserId,
        notes: Option<String>,
    ) -> Result<StockAdjustment, FulfillmentError> {
        if quantity < 0 {
            return Err(FulfillmentError::InvalidAdjustment(format!(
                "quantity cannot be negative (got {quantity})"
            )));
        }

        let previous = tx.lock_stock(product_id, location_id).await?.unwrap_or(0);
        let delta = quantity - previous;
        if delta == 0 {
            return Ok(StockAdjustment {
                previous,
                current: quantity,
                movement_id: None,
            });
        }

        tx.set_stock(product_id, location_id, quantity).await?;
        let movement = NewStockMovement::adjustment(product_id, location_id, delta, user_id, notes)?;
        let movement_id = tx.record_movement(&movement).await?;

        Ok(StockAdjustment {
            previous,
            current: quantity,
            movement_id: Some(movement_id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory_store::{InMemoryInventoryStore, NewPickingList};
    use pickline_inventory::{LocationPurpose, MovementType, NewPickingListItem, PickingItemStatus};

    struct Fixture {
        store: InMemoryInventoryStore,
        a: ProductId,
        l1: LocationId,
    }

    fn fixture() -> Fixture {
        let store = InMemoryInventoryStore::new();
        let a = store.add_product("A", "Alpha", 250);
        let l1 = store.add_location("L1", 1, LocationPurpose::Display);
        store.put_stock(a, l1, 10);
        Fixture { store, a, l1 }
    }

    async fn add_items(
        store: &InMemoryInventoryStore,
        items: &[(ProductId, &str, i64, Option<LocationId>)],
    ) -> Vec<PickingListItemId> {
        let mut tx = store.begin().await.unwrap();
        let list = tx
            .create_picking_list(&NewPickingList {
                source: "TEST".to_string(),
                invoice_no: format!("INV-{}", store.picking_lists().len() + 1),
                created_by: None,
            })
            .await
            .unwrap();
        let mut ids = Vec::new();
        for (product_id, sku, quantity, location) in items {
            let item = NewPickingListItem {
                product_id: *product_id,
                original_sku: sku.to_string(),
                quantity: *quantity,
                suggested_location_id: *location,
            };
            ids.push(tx.insert_picking_item(list, &item).await.unwrap());
        }
        tx.commit().await.unwrap();
        ids
    }

    #[tokio::test]
    async fn batch_with_unresolvable_item_changes_nothing() {
        let f = fixture();
        let z = f.store.add_product("Z", "Zulu", 100);
        let ids = add_items(&f.store, &[(f.a, "A", 2, Some(f.l1)), (z, "Z", 1, None)]).await;

        let report = FulfillmentCommitter::default()
            .complete_items(&f.store, &ids, UserId::new(1))
            .await
            .unwrap();

        assert!(!report.success);
        assert!(report.items[0].ok);
        assert!(!report.items[1].ok);
        assert_eq!(f.store.stock(f.a, f.l1), Some(10));
        assert!(f.store.movements().is_empty());
        assert!(f.store.picking_items().iter().all(|i| i.status == PickingItemStatus::Pending));
        assert!(report.into_result().is_err());
    }

    #[tokio::test]
    async fn successful_batch_deducts_and_records_sales() {
        let f = fixture();
        let ids = add_items(&f.store, &[(f.a, "A", 2, Some(f.l1)), (f.a, "A", 3, Some(f.l1))]).await;

        let report = FulfillmentCommitter::default()
            .complete_items(&f.store, &ids, UserId::new(7))
            .await
            .unwrap();

        assert!(report.success);
        assert_eq!(f.store.stock(f.a, f.l1), Some(5));
        let movements = f.store.movements();
        assert_eq!(movements.len(), 2);
        assert!(movements.iter().all(|m| m.movement.movement_type == MovementType::Sale
            && m.movement.from_location_id == Some(f.l1)
            && m.movement.user_id == UserId::new(7)));
        assert!(f.store.picking_items().iter().all(|i| i.status == PickingItemStatus::Validated));
    }

    #[tokio::test]
    async fn backorder_item_is_resolved_just_in_time() {
        let f = fixture();
        let ids = add_items(&f.store, &[(f.a, "A", 4, None)]).await;

        let report = FulfillmentCommitter::default()
            .complete_items(&f.store, &ids, UserId::new(1))
            .await
            .unwrap();

        assert!(report.success);
        assert_eq!(report.items[0].resolved_location, Some(f.l1));
        let item = &f.store.picking_items()[0];
        assert_eq!(item.suggested_location_id, Some(f.l1));
        assert_eq!(f.store.stock(f.a, f.l1), Some(6));
    }

    #[tokio::test]
    async fn componentless_package_backorder_gets_its_location() {
        let f = fixture();
        let p = f.store.add_package("P", "Loose package", 900, &[]);
        f.store.put_stock(p, f.l1, 10);
        let ids = add_items(&f.store, &[(p, "P", 2, None)]).await;

        let report = FulfillmentCommitter::default()
            .complete_items(&f.store, &ids, UserId::new(1))
            .await
            .unwrap();

        assert!(report.success);
        assert_eq!(report.items[0].resolved_location, Some(f.l1));
        assert_eq!(f.store.stock(p, f.l1), Some(8));
        let item = f.store.picking_items().into_iter().find(|i| i.id == ids[0]).unwrap();
        assert_eq!(item.suggested_location_id, Some(f.l1));
    }

    #[tokio::test]
    async fn componentless_package_uses_its_suggestion() {
        let f = fixture();
        let p = f.store.add_package("P", "Loose package", 900, &[]);
        let l2 = f.store.add_location("L2", 4, LocationPurpose::Display);
        f.store.put_stock(p, f.l1, 10);
        f.store.put_stock(p, l2, 3);
        let ids = add_items(&f.store, &[(p, "P", 2, Some(l2))]).await;

        let report = FulfillmentCommitter::default()
            .complete_items(&f.store, &ids, UserId::new(1))
            .await
            .unwrap();

        assert!(report.success);
        assert_eq!(f.store.stock(p, l2), Some(1));
        assert_eq!(f.store.stock(p, f.l1), Some(10));
    }

    #[tokio::test]
    async fn items_sharing_a_row_cannot_overdraw_it() {
        let f = fixture();
        let ids = add_items(&f.store, &[(f.a, "A", 6, Some(f.l1)), (f.a, "A", 6, Some(f.l1))]).await;

        let report = FulfillmentCommitter::default()
            .complete_items(&f.store, &ids, UserId::new(1))
            .await
            .unwrap();

        assert!(!report.success);
        assert!(report.items[1].error.as_deref().unwrap().contains("insufficient stock"));
        assert_eq!(f.store.stock(f.a, f.l1), Some(10));
    }

    #[tokio::test]
    async fn stale_suggestion_falls_back_to_another_location() {
        let f = fixture();
        let l3 = f.store.add_location("L3", 3, LocationPurpose::Display);
        f.store.put_stock(f.a, l3, 8);
        f.store.put_stock(f.a, f.l1, 1);
        let ids = add_items(&f.store, &[(f.a, "A", 5, Some(f.l1))]).await;

        let report = FulfillmentCommitter::default()
            .complete_items(&f.store, &ids, UserId::new(1))
            .await
            .unwrap();

        assert!(report.success);
        assert_eq!(report.items[0].deductions[0].location_id, l3);
        assert_eq!(f.store.stock(f.a, l3), Some(3));
        assert_eq!(f.store.stock(f.a, f.l1), Some(1));
    }

    #[tokio::test]
    async fn validated_and_missing_items_fail_the_batch() {
        let f = fixture();
        let ids = add_items(&f.store, &[(f.a, "A", 1, Some(f.l1))]).await;
        let committer = FulfillmentCommitter::default();
        assert!(committer.complete_items(&f.store, &ids, UserId::new(1)).await.unwrap().success);

        let again = committer
            .complete_items(&f.store, &[ids[0], PickingListItemId::new(9999)], UserId::new(1))
            .await
            .unwrap();
        assert!(!again.success);
        assert_eq!(again.items[0].error.as_deref(), Some("picking item already validated"));
        assert_eq!(again.items[1].error.as_deref(), Some("picking item not found"));
        assert_eq!(f.store.stock(f.a, f.l1), Some(9));
    }

    #[tokio::test]
    async fn set_quantity_records_signed_adjustments() {
        let f = fixture();
        let committer = FulfillmentCommitter::default();
        let mut tx = f.store.begin().await.unwrap();

        let down = committer
            .set_quantity(&mut tx, f.a, f.l1, 7, UserId::new(2), Some("recount".into()))
            .await
            .unwrap();
        assert_eq!((down.previous, down.current), (10, 7));
        assert!(down.movement_id.is_some());

        let same = committer
            .set_quantity(&mut tx, f.a, f.l1, 7, UserId::new(2), None)
            .await
            .unwrap();
        assert_eq!(same.movement_id, None);

        let movements = tx.movements_for_product(f.a).await.unwrap();
        assert_eq!(movements.len(), 1);
        assert_eq!(movements[0].movement.from_location_id, Some(f.l1));
        assert_eq!(movements[0].movement.quantity, 3);
        assert_eq!(movements[0].movement.movement_type, MovementType::Adjustment);

        assert!(committer
            .set_quantity(&mut tx, f.a, f.l1, -1, UserId::new(2), None)
            .await
            .is_err());
    }
}
