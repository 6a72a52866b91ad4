//! Stock report export: raw (SKU, location) rows plus a per-SKU pivot.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;

use tokio_stream::StreamExt;
use tracing::{debug, instrument};

use crate::inventory_store::{InventoryTx, StockReportFilter, StockReportRow};

use super::throttle::ThrottleConfig;
use super::{ExportError, ExportStats, format_cents};

const RAW_HEADER: [&str; 8] = [
    "sku",
    "name",
    "location",
    "floor",
    "purpose",
    "quantity",
    "unit_price",
    "value",
];

/// Running totals for one SKU.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SkuTotals {
    pub name: String,
    pub by_location: BTreeMap<String, i64>,
    pub quantity: i64,
    pub value_cents: i128,
}

/// Stock value of one row; wide enough that no i64 pair overflows.
fn row_value_cents(row: &StockReportRow) -> i128 {
    i128::from(row.quantity) * i128::from(row.price_cents)
}

/// Per-SKU aggregation of streamed rows. Grows with distinct SKUs (and the
/// locations each is stocked in), never with row count.
#[derive(Debug, Clone, Default)]
pub struct StockPivot {
    skus: BTreeMap<String, SkuTotals>,
    locations: BTreeSet<String>,
}

impl StockPivot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, row: &StockReportRow) {
        if !self.locations.contains(&row.location_code) {
            self.locations.insert(row.location_code.clone());
        }
        let totals = self.skus.entry(row.sku.clone()).or_insert_with(|| SkuTotals {
            name: row.name.clone(),
            ..Default::default()
        });
        let at_location = totals.by_location.entry(row.location_code.clone()).or_insert(0);
        *at_location = at_location.saturating_add(row.quantity);
        totals.quantity = totals.quantity.saturating_add(row.quantity);
        totals.value_cents = totals.value_cents.saturating_add(row_value_cents(row));
    }

    pub fn len(&self) -> usize {
        self.skus.len()
    }

    pub fn is_empty(&self) -> bool {
        self.skus.is_empty()
    }

    pub fn get(&self, sku: &str) -> Option<&SkuTotals> {
        self.skus.get(sku)
    }

    /// Location codes seen so far; these become the pivot's columns.
    pub fn location_codes(&self) -> impl Iterator<Item = &str> {
        self.locations.iter().map(String::as_str)
    }

    /// One row per SKU with a column per location, then the grand totals.
    pub fn write_csv<W: Write>(&self, out: W) -> Result<(), ExportError> {
        let mut writer = csv::Writer::from_writer(out);

        let mut header = vec!["sku", "name"];
        header.extend(self.location_codes());
        header.extend(["total_quantity", "total_value"]);
        writer.write_record(&header)?;

        for (sku, totals) in &self.skus {
            let mut record = vec![sku.clone(), totals.name.clone()];
            record.extend(self.locations.iter().map(|code| {
                totals
                    .by_location
                    .get(code)
                    .map(i64::to_string)
                    .unwrap_or_default()
            }));
            record.push(totals.quantity.to_string());
            record.push(format_cents(totals.value_cents));
            writer.write_record(&record)?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Stream the filtered stock report: every row goes straight to `raw`, the
/// pivot goes to `summary` once the stream is exhausted.
#[instrument(skip(tx, filter, raw, summary, throttle), err)]
pub async fn stream_stock_report<T, R, S>(
    tx: &mut T,
    filter: &StockReportFilter,
    raw: R,
    summary: S,
    throttle: ThrottleConfig,
) -> Result<ExportStats, ExportError>
where
    T: InventoryTx,
    R: Write,
    S: Write,
{
    let mut raw = csv::Writer::from_writer(raw);
    raw.write_record(RAW_HEADER)?;

    let mut pivot = StockPivot::new();
    let mut throttle = throttle.start();
    let mut rows = 0u64;

    let mut stream = tx.stream_stock_report(filter);
    while let Some(row) = stream.next().await {
        let row = row?;
        raw.write_record([
            row.sku.clone(),
            row.name.clone(),
            row.location_code.clone(),
            row.floor.to_string(),
            row.purpose.as_str().to_string(),
            row.quantity.to_string(),
            format_cents(row.price_cents.into()),
            format_cents(row_value_cents(&row)),
        ])?;
        pivot.add(&row);
        rows += 1;
        throttle.tick().await;
    }
    raw.flush()?;
    pivot.write_csv(summary)?;

    debug!(rows, skus = pivot.len(), "stock report streamed");
    Ok(ExportStats {
        rows,
        distinct_skus: pivot.len(),
        pauses: throttle.pauses(),
    })
}
