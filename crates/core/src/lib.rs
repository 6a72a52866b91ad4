//! `pickline-core` — identifiers and error primitives shared by every crate.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{JobId, LocationId, PickingListId, PickingListItemId, ProductId, UserId};
