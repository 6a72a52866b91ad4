use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;

use pickline_core::{LocationId, PickingListId, PickingListItemId, ProductId, UserId};
use pickline_inventory::{
    Location, LocationPurpose, NewPickingListItem, NewStockMovement, PackageComponent,
    PickingItemStatus, PickingListItem, Product, StockCandidate, StockMovement,
};

use super::r#trait::{
    InventoryStore, InventoryTx, LockMode, NewPickingList, ProductChanges, ProductMasterFilter,
    ProductMasterRow, RowStream, StockReportFilter, StockReportRow, StoreError,
    check_savepoint_name,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ComponentLink {
    package: ProductId,
    component: ProductId,
    quantity_per_package: i64,
}

/// A picking list header as held by the in-memory store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PickingListRecord {
    pub id: PickingListId,
    pub source: String,
    pub invoice_no: String,
    pub created_by: Option<UserId>,
}

#[derive(Debug, Clone, Default)]
struct InventoryState {
    products: BTreeMap<ProductId, Product>,
    components: Vec<ComponentLink>,
    locations: BTreeMap<LocationId, Location>,
    stock: BTreeMap<(ProductId, LocationId), i64>,
    movements: Vec<StockMovement>,
    picking_lists: Vec<PickingListRecord>,
    items: BTreeMap<PickingListItemId, PickingListItem>,
    next_id: i64,
}

impl InventoryState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn components_of(&self, package: ProductId) -> Vec<PackageComponent> {
        self.components
            .iter()
            .filter(|link| link.package == package)
            .filter_map(|link| {
                let component = self.products.get(&link.component)?;
                Some(PackageComponent {
                    package_product_id: link.package,
                    component_product_id: link.component,
                    component_sku: component.sku.clone(),
                    component_is_package: component.is_package,
                    quantity_per_package: link.quantity_per_package,
                })
            })
            .collect()
    }
}

/// In-memory inventory store.
///
/// Intended for tests/dev. A transaction works on a private copy of the state
/// and publishes it on commit; concurrent transactions are last-writer-wins,
/// so there is no row locking here.
#[derive(Debug, Clone, Default)]
pub struct InMemoryInventoryStore {
    state: Arc<RwLock<InventoryState>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryInventoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, InventoryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, InventoryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make `begin` fail as if no connection could be acquired.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn add_product(&self, sku: &str, name: &str, price_cents: i64) -> ProductId {
        self.insert_product(sku, name, price_cents, false)
    }

    /// Add a package product made of `components` (component id, quantity per package).
    pub fn add_package(
        &self,
        sku: &str,
        name: &str,
        price_cents: i64,
        components: &[(ProductId, i64)],
    ) -> ProductId {
        let id = self.insert_product(sku, name, price_cents, true);
        for (component, quantity) in components {
            self.add_component(id, *component, *quantity);
        }
        id
    }

    pub fn add_component(&self, package: ProductId, component: ProductId, quantity_per_package: i64) {
        self.write().components.push(ComponentLink {
            package,
            component,
            quantity_per_package,
        });
    }

    fn insert_product(&self, sku: &str, name: &str, price_cents: i64, is_package: bool) -> ProductId {
        let mut state = self.write();
        let id = ProductId::new(state.next_id());
        state.products.insert(
            id,
            Product {
                id,
                sku: sku.to_string(),
                name: name.to_string(),
                price_cents,
                is_active: true,
                is_package,
            },
        );
        id
    }

    pub fn add_location(&self, code: &str, floor: i32, purpose: LocationPurpose) -> LocationId {
        let mut state = self.write();
        let id = LocationId::new(state.next_id());
        state.locations.insert(
            id,
            Location {
                id,
                code: code.to_string(),
                floor,
                purpose,
            },
        );
        id
    }

    pub fn put_stock(&self, product: ProductId, location: LocationId, quantity: i64) {
        self.write().stock.insert((product, location), quantity);
    }

    pub fn stock(&self, product: ProductId, location: LocationId) -> Option<i64> {
        self.read().stock.get(&(product, location)).copied()
    }

    pub fn product(&self, id: ProductId) -> Option<Product> {
        self.read().products.get(&id).cloned()
    }

    pub fn movements(&self) -> Vec<StockMovement> {
        self.read().movements.clone()
    }

    pub fn picking_lists(&self) -> Vec<PickingListRecord> {
        self.read().picking_lists.clone()
    }

    /// All picking items, in id order.
    pub fn picking_items(&self) -> Vec<PickingListItem> {
        self.read().items.values().cloned().collect()
    }
}

#[async_trait::async_trait]
impl InventoryStore for InMemoryInventoryStore {
    type Tx = InMemoryInventoryTx;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store is offline".to_string()));
        }
        let snapshot = self.read().clone();
        Ok(InMemoryInventoryTx {
            shared: Arc::clone(&self.state),
            state: snapshot,
            savepoints: Vec::new(),
        })
    }
}

/// Transaction over a private copy of the in-memory state.
#[derive(Debug)]
pub struct InMemoryInventoryTx {
    shared: Arc<RwLock<InventoryState>>,
    state: InventoryState,
    savepoints: Vec<(String, InventoryState)>,
}

impl InMemoryInventoryTx {
    fn require_product(&self, id: ProductId, operation: &str) -> Result<&Product, StoreError> {
        self.state
            .products
            .get(&id)
            .ok_or_else(|| StoreError::NotFound(format!("product {id} in {operation}")))
    }

    fn require_location(&self, id: LocationId, operation: &str) -> Result<&Location, StoreError> {
        self.state
            .locations
            .get(&id)
            .ok_or_else(|| StoreError::NotFound(format!("location {id} in {operation}")))
    }

    fn savepoint_index(&self, name: &str) -> Result<usize, StoreError> {
        self.savepoints
            .iter()
            .rposition(|(n, _)| n == name)
            .ok_or_else(|| StoreError::Database {
                operation: "savepoint".to_string(),
                message: format!("savepoint {name} does not exist"),
            })
    }
}

#[async_trait::async_trait]
impl InventoryTx for InMemoryInventoryTx {
    async fn product(&mut self, id: ProductId) -> Result<Option<Product>, StoreError> {
        Ok(self.state.products.get(&id).cloned())
    }

    async fn products_by_sku(&mut self, skus: &[String]) -> Result<HashMap<String, Product>, StoreError> {
        Ok(self
            .state
            .products
            .values()
            .filter(|p| skus.contains(&p.sku))
            .map(|p| (p.sku.clone(), p.clone()))
            .collect())
    }

    async fn package_components(
        &mut self,
        package_ids: &[ProductId],
    ) -> Result<HashMap<ProductId, Vec<PackageComponent>>, StoreError> {
        let mut components = HashMap::new();
        for id in package_ids {
            let list = self.state.components_of(*id);
            if !list.is_empty() {
                components.insert(*id, list);
            }
        }
        Ok(components)
    }

    async fn update_product(&mut self, id: ProductId, changes: &ProductChanges) -> Result<(), StoreError> {
        let product = self
            .state
            .products
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("product {id}")))?;
        if let Some(name) = &changes.name {
            product.name = name.clone();
        }
        if let Some(price) = changes.price_cents {
            product.price_cents = price;
        }
        if let Some(active) = changes.is_active {
            product.is_active = active;
        }
        Ok(())
    }

    async fn locations_by_code(&mut self, codes: &[String]) -> Result<HashMap<String, Location>, StoreError> {
        Ok(self
            .state
            .locations
            .values()
            .filter(|l| codes.contains(&l.code))
            .map(|l| (l.code.clone(), l.clone()))
            .collect())
    }

    async fn stock_candidates(
        &mut self,
        product_id: ProductId,
        _lock: LockMode,
    ) -> Result<Vec<StockCandidate>, StoreError> {
        let state = &self.state;
        Ok(state
            .stock
            .iter()
            .filter(|((p, _), qty)| *p == product_id && **qty > 0)
            .filter_map(|((_, location_id), qty)| {
                let location = state.locations.get(location_id)?;
                (location.purpose == LocationPurpose::Display).then(|| StockCandidate {
                    location_id: *location_id,
                    location_code: location.code.clone(),
                    floor: location.floor,
                    purpose: location.purpose,
                    quantity: *qty,
                })
            })
            .collect())
    }

    async fn lock_stock(
        &mut self,
        product_id: ProductId,
        location_id: LocationId,
    ) -> Result<Option<i64>, StoreError> {
        Ok(self.state.stock.get(&(product_id, location_id)).copied())
    }

    async fn adjust_stock(
        &mut self,
        product_id: ProductId,
        location_id: LocationId,
        delta: i64,
    ) -> Result<i64, StoreError> {
        let quantity = self
            .state
            .stock
            .get_mut(&(product_id, location_id))
            .ok_or_else(|| {
                StoreError::NotFound(format!(
                    "stock row for product {product_id} at location {location_id}"
                ))
            })?;
        let updated = *quantity + delta;
        if updated < 0 {
            return Err(StoreError::Conflict {
                operation: "adjust_stock".to_string(),
                message: format!("quantity would become {updated}"),
            });
        }
        *quantity = updated;
        Ok(updated)
    }

    async fn set_stock(
        &mut self,
        product_id: ProductId,
        location_id: LocationId,
        quantity: i64,
    ) -> Result<(), StoreError> {
        self.require_product(product_id, "set_stock")?;
        self.require_location(location_id, "set_stock")?;
        if quantity < 0 {
            return Err(StoreError::Conflict {
                operation: "set_stock".to_string(),
                message: format!("negative quantity {quantity}"),
            });
        }
        self.state.stock.insert((product_id, location_id), quantity);
        Ok(())
    }

    async fn record_movement(&mut self, movement: &NewStockMovement) -> Result<i64, StoreError> {
        self.require_product(movement.product_id, "record_movement")?;
        let id = self.state.next_id();
        self.state.movements.push(StockMovement {
            id,
            movement: movement.clone(),
            created_at: Utc::now(),
        });
        Ok(id)
    }

    async fn movements_for_product(&mut self, product_id: ProductId) -> Result<Vec<StockMovement>, StoreError> {
        Ok(self
            .state
            .movements
            .iter()
            .filter(|m| m.movement.product_id == product_id)
            .cloned()
            .collect())
    }

    async fn picking_list_exists(&mut self, source: &str, invoice_no: &str) -> Result<bool, StoreError> {
        Ok(self
            .state
            .picking_lists
            .iter()
            .any(|l| l.source == source && l.invoice_no == invoice_no))
    }

    async fn create_picking_list(&mut self, list: &NewPickingList) -> Result<PickingListId, StoreError> {
        if self.picking_list_exists(&list.source, &list.invoice_no).await? {
            return Err(StoreError::Conflict {
                operation: "create_picking_list".to_string(),
                message: format!("{} invoice {} already imported", list.source, list.invoice_no),
            });
        }
        let id = PickingListId::new(self.state.next_id());
        self.state.picking_lists.push(PickingListRecord {
            id,
            source: list.source.clone(),
            invoice_no: list.invoice_no.clone(),
            created_by: list.created_by,
        });
        Ok(id)
    }

    async fn insert_picking_item(
        &mut self,
        list_id: PickingListId,
        item: &NewPickingListItem,
    ) -> Result<PickingListItemId, StoreError> {
        if !self.state.picking_lists.iter().any(|l| l.id == list_id) {
            return Err(StoreError::NotFound(format!("picking list {list_id}")));
        }
        self.require_product(item.product_id, "insert_picking_item")?;
        let id = PickingListItemId::new(self.state.next_id());
        self.state.items.insert(
            id,
            PickingListItem {
                id,
                picking_list_id: list_id,
                product_id: item.product_id,
                original_sku: item.original_sku.clone(),
                quantity: item.quantity,
                status: PickingItemStatus::Pending,
                suggested_location_id: item.suggested_location_id,
                validated_by: None,
                validated_at: None,
            },
        );
        Ok(id)
    }

    async fn picking_items(&mut self, ids: &[PickingListItemId]) -> Result<Vec<PickingListItem>, StoreError> {
        Ok(self
            .state
            .items
            .values()
            .filter(|item| ids.contains(&item.id))
            .cloned()
            .collect())
    }

    async fn set_suggested_location(
        &mut self,
        item_id: PickingListItemId,
        location_id: LocationId,
    ) -> Result<(), StoreError> {
        let item = self
            .state
            .items
            .get_mut(&item_id)
            .ok_or_else(|| StoreError::NotFound(format!("picking item {item_id}")))?;
        item.suggested_location_id = Some(location_id);
        Ok(())
    }

    async fn mark_item_validated(&mut self, item_id: PickingListItemId, user_id: UserId) -> Result<(), StoreError> {
        let item = self
            .state
            .items
            .get_mut(&item_id)
            .ok_or_else(|| StoreError::NotFound(format!("picking item {item_id}")))?;
        item.status = PickingItemStatus::Validated;
        item.validated_by = Some(user_id);
        item.validated_at = Some(Utc::now());
        Ok(())
    }

    async fn savepoint(&mut self, name: &str) -> Result<(), StoreError> {
        check_savepoint_name(name)?;
        self.savepoints.push((name.to_string(), self.state.clone()));
        Ok(())
    }

    async fn release_savepoint(&mut self, name: &str) -> Result<(), StoreError> {
        check_savepoint_name(name)?;
        let idx = self.savepoint_index(name)?;
        self.savepoints.truncate(idx);
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<(), StoreError> {
        check_savepoint_name(name)?;
        let idx = self.savepoint_index(name)?;
        // The savepoint itself survives a rollback to it, like in Postgres.
        self.state = self.savepoints[idx].1.clone();
        self.savepoints.truncate(idx + 1);
        Ok(())
    }

    fn stream_stock_report<'a>(&'a mut self, filter: &'a StockReportFilter) -> RowStream<'a, StockReportRow> {
        let state = &self.state;
        let mut rows: Vec<StockReportRow> = state
            .stock
            .iter()
            .filter_map(|((product_id, location_id), qty)| {
                let product = state.products.get(product_id)?;
                let location = state.locations.get(location_id)?;
                Some(StockReportRow {
                    sku: product.sku.clone(),
                    name: product.name.clone(),
                    price_cents: product.price_cents,
                    location_code: location.code.clone(),
                    floor: location.floor,
                    purpose: location.purpose,
                    quantity: *qty,
                })
            })
            .filter(|row| {
                filter
                    .sku_prefix
                    .as_deref()
                    .is_none_or(|prefix| row.sku.starts_with(prefix))
                    && filter.floor.is_none_or(|floor| row.floor == floor)
                    && filter.purpose.is_none_or(|purpose| row.purpose == purpose)
                    && (filter.include_empty || row.quantity != 0)
            })
            .collect();
        rows.sort_by(|a, b| {
            a.sku
                .cmp(&b.sku)
                .then_with(|| a.location_code.cmp(&b.location_code))
        });
        Box::pin(tokio_stream::iter(rows.into_iter().map(Ok::<_, StoreError>)))
    }

    fn stream_products<'a>(&'a mut self, filter: &'a ProductMasterFilter) -> RowStream<'a, ProductMasterRow> {
        let state = &self.state;
        let mut rows: Vec<ProductMasterRow> = state
            .products
            .values()
            .filter(|p| !filter.active_only || p.is_active)
            .filter(|p| {
                filter
                    .sku_prefix
                    .as_deref()
                    .is_none_or(|prefix| p.sku.starts_with(prefix))
            })
            .map(|p| ProductMasterRow {
                sku: p.sku.clone(),
                name: p.name.clone(),
                price_cents: p.price_cents,
                is_active: p.is_active,
                is_package: p.is_package,
                components: state
                    .components_of(p.id)
                    .iter()
                    .map(|c| format!("{} x{}", c.component_sku, c.quantity_per_package))
                    .collect::<Vec<_>>()
                    .join("; "),
            })
            .collect();
        rows.sort_by(|a, b| a.sku.cmp(&b.sku));
        Box::pin(tokio_stream::iter(rows.into_iter().map(Ok::<_, StoreError>)))
    }

    async fn commit(self) -> Result<(), StoreError> {
        let mut shared = self.shared.write().unwrap_or_else(PoisonError::into_inner);
        *shared = self.state;
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        Ok(())
    }
}
