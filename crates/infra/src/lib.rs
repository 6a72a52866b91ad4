//! Infrastructure layer: persistence, job processing, imports and exports.
//!
//! `pickline_inventory` decides; this crate reads the rows it needs, runs it
//! inside database transactions, and writes back what it decided.

pub mod allocation;
pub mod bulk;
pub mod config;
pub mod db;
pub mod fulfillment;
pub mod imports;
pub mod inventory_store;
pub mod jobs;
pub mod wiring;

#[cfg(test)]
mod integration_tests;
