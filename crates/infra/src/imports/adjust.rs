//! Stock adjustment import.
//!
//! The whole file commits or nothing does. Rows that name an unknown SKU or
//! location are reported and skipped. Two rows counting the same
//! (SKU, location) differently, or giving one SKU two different names,
//! prices or active flags, make the file ambiguous and fail the job.

use std::collections::{BTreeSet, HashMap};

use tracing::{debug, info, instrument};

use crate::fulfillment::FulfillmentCommitter;
use crate::inventory_store::{InventoryTx, ProductChanges};
use crate::jobs::{Job, JobError, JobHandler, JobOutcome};

use super::parser::{ImportParser, StockAdjustment};
use super::report::ImportReport;

pub struct StockAdjustmentHandler<P> {
    parser: P,
    committer: FulfillmentCommitter,
}

impl<P: ImportParser> StockAdjustmentHandler<P> {
    pub fn new(parser: P, committer: FulfillmentCommitter) -> Self {
        Self { parser, committer }
    }
}

/// First value seen for one catalog field of a SKU, with its row.
type FieldSeen<V> = Option<(usize, V)>;

#[derive(Default)]
struct CatalogSeen {
    name: FieldSeen<String>,
    price_cents: FieldSeen<i64>,
    is_active: FieldSeen<bool>,
}

/// Record `value` for a field; `Ok(true)` when it is new information.
fn merge_field<V>(slot: &mut FieldSeen<V>, row: usize, value: &Option<V>, sku: &str, field: &str) -> Result<bool, JobError>
where
    V: Clone + PartialEq + std::fmt::Debug,
{
    let Some(value) = value else {
        return Ok(false);
    };
    match slot {
        None => {
            *slot = Some((row, value.clone()));
            Ok(true)
        }
        Some((_, first)) if first == value => Ok(false),
        Some((first_row, first)) => Err(JobError::Validation(format!(
            "rows {first_row} and {row} give {sku} different {field}: {first:?} and {value:?}"
        ))),
    }
}

/// Drop rows that repeat earlier ones and reject rows that disagree with
/// them, either on a count for the same (SKU, location) or on a catalog
/// field of the same SKU. Returns the rows to apply and how many were dropped.
fn dedupe(adjustments: Vec<StockAdjustment>) -> Result<(Vec<StockAdjustment>, usize), JobError> {
    let mut counts: HashMap<(String, String), (usize, i64)> = HashMap::new();
    let mut catalog: HashMap<String, CatalogSeen> = HashMap::new();
    let mut kept = Vec::with_capacity(adjustments.len());
    let mut skipped = 0;

    for adjustment in adjustments {
        let repeat_sku = catalog.contains_key(&adjustment.sku);
        let mut adds_something = !repeat_sku;

        if let (Some(location), Some(quantity)) = (&adjustment.location_code, adjustment.quantity) {
            let key = (adjustment.sku.clone(), location.clone());
            match counts.get(&key) {
                Some(&(_, q)) if q == quantity => {}
                Some(&(first_row, q)) => {
                    return Err(JobError::Validation(format!(
                        "rows {first_row} and {} count {} at {} as {q} and {quantity}",
                        adjustment.row, adjustment.sku, location
                    )));
                }
                None => {
                    counts.insert(key, (adjustment.row, quantity));
                    adds_something = true;
                }
            }
        } else if adjustment.location_code.is_some() || adjustment.quantity.is_some() {
            // Incomplete stock fields are reported by the handler.
            adds_something = true;
        }

        let seen = catalog.entry(adjustment.sku.clone()).or_default();
        let (row, sku) = (adjustment.row, adjustment.sku.as_str());
        adds_something |= merge_field(&mut seen.name, row, &adjustment.name, sku, "name")?;
        adds_something |= merge_field(&mut seen.price_cents, row, &adjustment.price_cents, sku, "price")?;
        adds_something |= merge_field(&mut seen.is_active, row, &adjustment.is_active, sku, "active flag")?;

        if adds_something {
            kept.push(adjustment);
        } else {
            skipped += 1;
        }
    }
    Ok((kept, skipped))
}

fn unique<'a>(values: impl Iterator<Item = &'a String>) -> Vec<String> {
    values.cloned().collect::<BTreeSet<_>>().into_iter().collect()
}

#[async_trait::async_trait]
impl<T, P> JobHandler<T> for StockAdjustmentHandler<P>
where
    T: InventoryTx,
    P: ImportParser,
{
    #[instrument(skip(self, job, tx), fields(job_id = %job.id), err)]
    async fn handle(&self, job: &Job, tx: &mut T) -> Result<JobOutcome, JobError> {
        let user_id = job
            .user_id
            .ok_or_else(|| JobError::Payload("stock adjustment requires a user".to_string()))?;
        let path = job.require_file()?;
        let content = tokio::fs::read(path).await.map_err(|e| JobError::io(path, e))?;
        let import = self.parser.parse_adjustments(&content).map_err(|e| e.in_file(path))?;

        let mut report = ImportReport::with_errors(import.row_errors);
        let (adjustments, duplicates) = dedupe(import.adjustments)?;
        report.skipped_count += duplicates;

        let skus = unique(adjustments.iter().map(|a| &a.sku));
        let codes = unique(adjustments.iter().filter_map(|a| a.location_code.as_ref()));
        let products = tx.products_by_sku(&skus).await?;
        let locations = tx.locations_by_code(&codes).await?;
        debug!(skus = skus.len(), locations = codes.len(), "catalog prefetched");

        for adjustment in &adjustments {
            let key = Some(adjustment.sku.as_str());
            let Some(product) = products.get(&adjustment.sku) else {
                report.error(adjustment.row, key, format!("unknown SKU {}", adjustment.sku));
                continue;
            };

            let target = match (&adjustment.location_code, adjustment.quantity) {
                (Some(code), Some(quantity)) => match locations.get(code) {
                    Some(location) => Some((location.id, quantity)),
                    None => {
                        report.error(adjustment.row, key, format!("unknown location {code}"));
                        continue;
                    }
                },
                (None, None) => None,
                (Some(code), None) => {
                    report.error(adjustment.row, key, format!("no quantity given for location {code}"));
                    continue;
                }
                (None, Some(_)) => {
                    report.error(adjustment.row, key, "quantity given without a location");
                    continue;
                }
            };

            let changes = ProductChanges {
                name: adjustment.name.clone(),
                price_cents: adjustment.price_cents,
                is_active: adjustment.is_active,
            };
            if !changes.is_empty() {
                tx.update_product(product.id, &changes).await?;
            }

            if let Some((location_id, quantity)) = target {
                let notes = format!("stock adjustment job {} row {}", job.id, adjustment.row);
                let applied = self
                    .committer
                    .set_quantity(tx, product.id, location_id, quantity, user_id, Some(notes))
                    .await?;
                debug!(
                    sku = %adjustment.sku,
                    previous = applied.previous,
                    current = applied.current,
                    "stock counted"
                );
            }
            report.success_count += 1;
        }

        info!(
            applied = report.success_count,
            skipped = report.skipped_count,
            errors = report.error_rows.len(),
            "stock adjustment finished"
        );
        Ok(report.into_outcome(job.job_type.as_str(), "rows"))
    }
}
