use std::collections::HashMap;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_stream::Stream;

use pickline_core::{LocationId, PickingListId, PickingListItemId, ProductId, UserId};
use pickline_inventory::{
    Location, LocationPurpose, NewPickingListItem, NewStockMovement, PackageComponent,
    PickingListItem, Product, StockCandidate, StockMovement,
};

/// Inventory persistence error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("database error in {operation}: {message}")]
    Database { operation: String, message: String },

    /// Unique/check constraint rejected the write (e.g. negative stock).
    #[error("conflict in {operation}: {message}")]
    Conflict { operation: String, message: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("failed to decode row: {0}")]
    Decode(String),

    /// No connection could be acquired (pool closed, timed out, network).
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Lazy, finite, single-pass sequence of rows pulled from an open transaction.
pub type RowStream<'a, T> = Pin<Box<dyn Stream<Item = Result<T, StoreError>> + Send + 'a>>;

/// Whether a stock read should take row locks (`SELECT … FOR UPDATE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    ForUpdate,
}

/// Header of a picking list created by an import.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPickingList {
    /// Import channel tag, e.g. `SALES_A`.
    pub source: String,
    pub invoice_no: String,
    pub created_by: Option<UserId>,
}

/// Partial update of catalog attributes. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductChanges {
    pub name: Option<String>,
    pub price_cents: Option<i64>,
    pub is_active: Option<bool>,
}

impl ProductChanges {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.price_cents.is_none() && self.is_active.is_none()
    }
}

/// Filters for the stock report export.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StockReportFilter {
    /// Literal prefix; `%` and `_` match only themselves.
    pub sku_prefix: Option<String>,
    pub floor: Option<i32>,
    pub purpose: Option<LocationPurpose>,
    /// Include rows whose quantity is zero.
    pub include_empty: bool,
}

/// One raw (product, location) row of the stock report, sorted by SKU then location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockReportRow {
    pub sku: String,
    pub name: String,
    pub price_cents: i64,
    pub location_code: String,
    pub floor: i32,
    pub purpose: LocationPurpose,
    pub quantity: i64,
}

/// Filters for the product master export.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProductMasterFilter {
    pub sku_prefix: Option<String>,
    pub active_only: bool,
}

/// One product master row; `components` is a `SKU xN; …` rendering for packages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductMasterRow {
    pub sku: String,
    pub name: String,
    pub price_cents: i64,
    pub is_active: bool,
    pub is_package: bool,
    pub components: String,
}

/// Source of inventory transactions.
#[async_trait::async_trait]
pub trait InventoryStore: Send + Sync + 'static {
    type Tx: InventoryTx;

    /// Acquire a connection and open a transaction on it.
    async fn begin(&self) -> Result<Self::Tx, StoreError>;
}

/// An open inventory transaction.
///
/// Every read and write goes through the same connection; nothing is visible
/// to other transactions until `commit`. Dropping without `commit` rolls back.
#[async_trait::async_trait]
pub trait InventoryTx: Send + 'static {
    // --- catalog -----------------------------------------------------------

    async fn product(&mut self, id: ProductId) -> Result<Option<Product>, StoreError>;

    /// Batch lookup keyed by SKU; unknown SKUs are absent from the map.
    async fn products_by_sku(&mut self, skus: &[String]) -> Result<HashMap<String, Product>, StoreError>;

    /// Components of the given packages, in package order.
    async fn package_components(
        &mut self,
        package_ids: &[ProductId],
    ) -> Result<HashMap<ProductId, Vec<PackageComponent>>, StoreError>;

    async fn update_product(&mut self, id: ProductId, changes: &ProductChanges) -> Result<(), StoreError>;

    async fn locations_by_code(&mut self, codes: &[String]) -> Result<HashMap<String, Location>, StoreError>;

    // --- stock -------------------------------------------------------------

    /// Display-purpose rows with positive stock for a product.
    async fn stock_candidates(
        &mut self,
        product_id: ProductId,
        lock: LockMode,
    ) -> Result<Vec<StockCandidate>, StoreError>;

    /// Lock a single stock row and return its quantity (`None` if the row does not exist).
    async fn lock_stock(
        &mut self,
        product_id: ProductId,
        location_id: LocationId,
    ) -> Result<Option<i64>, StoreError>;

    /// Add `delta` to an existing stock row; returns the new quantity.
    async fn adjust_stock(
        &mut self,
        product_id: ProductId,
        location_id: LocationId,
        delta: i64,
    ) -> Result<i64, StoreError>;

    /// Set an absolute quantity, creating the row if needed.
    async fn set_stock(
        &mut self,
        product_id: ProductId,
        location_id: LocationId,
        quantity: i64,
    ) -> Result<(), StoreError>;

    // --- ledger ------------------------------------------------------------

    async fn record_movement(&mut self, movement: &NewStockMovement) -> Result<i64, StoreError>;

    async fn movements_for_product(&mut self, product_id: ProductId) -> Result<Vec<StockMovement>, StoreError>;

    // --- picking -----------------------------------------------------------

    async fn picking_list_exists(&mut self, source: &str, invoice_no: &str) -> Result<bool, StoreError>;

    async fn create_picking_list(&mut self, list: &NewPickingList) -> Result<PickingListId, StoreError>;

    async fn insert_picking_item(
        &mut self,
        list_id: PickingListId,
        item: &NewPickingListItem,
    ) -> Result<PickingListItemId, StoreError>;

    /// Load and lock picking items; unknown ids are absent from the result.
    async fn picking_items(&mut self, ids: &[PickingListItemId]) -> Result<Vec<PickingListItem>, StoreError>;

    async fn set_suggested_location(
        &mut self,
        item_id: PickingListItemId,
        location_id: LocationId,
    ) -> Result<(), StoreError>;

    async fn mark_item_validated(&mut self, item_id: PickingListItemId, user_id: UserId) -> Result<(), StoreError>;

    // --- savepoints ----------------------------------------------------------

    async fn savepoint(&mut self, name: &str) -> Result<(), StoreError>;

    async fn release_savepoint(&mut self, name: &str) -> Result<(), StoreError>;

    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<(), StoreError>;

    // --- streaming -----------------------------------------------------------

    fn stream_stock_report<'a>(&'a mut self, filter: &'a StockReportFilter) -> RowStream<'a, StockReportRow>;

    fn stream_products<'a>(&'a mut self, filter: &'a ProductMasterFilter) -> RowStream<'a, ProductMasterRow>;

    // --- lifecycle -----------------------------------------------------------

    async fn commit(self) -> Result<(), StoreError>;

    async fn rollback(self) -> Result<(), StoreError>;
}

/// Savepoint names are interpolated into SQL, so restrict them to identifiers.
pub(crate) fn check_savepoint_name(name: &str) -> Result<(), StoreError> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && name.starts_with(|c: char| c.is_ascii_lowercase() || c == '_')
        && name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StoreError::Database {
            operation: "savepoint".to_string(),
            message: format!("invalid savepoint name: {name:?}"),
        })
    }
}
