//! Inventory domain module.
//!
//! This crate contains business rules for stock allocation and fulfillment,
//! implemented purely as deterministic domain logic (no IO, no SQL, no files).
//! Infrastructure feeds it rows and persists what it decides.

pub mod allocation;
pub mod ledger;
pub mod location;
pub mod picking;
pub mod product;

pub use allocation::{
    AllocationError, Demand, MAX_PACKAGE_DEPTH, PREFERRED_FLOORS, Pick, StockCandidate,
    allocated_quantity, backorder_quantity, expand_package, rank, resolve,
};
pub use ledger::{MovementType, NewStockMovement, StockMovement};
pub use location::{Location, LocationPurpose};
pub use picking::{NewPickingListItem, PickingItemStatus, PickingListItem};
pub use product::{PackageComponent, Product};
