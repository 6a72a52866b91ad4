//! Inventory persistence boundary.
//!
//! Everything that reads or writes products, locations, stock rows, picking
//! lists, and the movement ledger goes through an `InventoryTx`, so one job
//! runs on one connection inside one transaction.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::{InMemoryInventoryStore, InMemoryInventoryTx, PickingListRecord};
pub use postgres::{PostgresInventoryStore, PostgresInventoryTx};
pub use r#trait::{
    InventoryStore, InventoryTx, LockMode, NewPickingList, ProductChanges, ProductMasterFilter,
    ProductMasterRow, RowStream, StockReportFilter, StockReportRow, StoreError,
};
