//! Streaming bulk exports.
//!
//! Rows are pulled one at a time from a store stream and written straight to
//! their sink; only per-SKU aggregates are held in memory. A `Throttle` pauses
//! between batches so a large export does not monopolise the worker.

use std::path::Path;

use serde::Serialize;
use thiserror::Error;

use crate::inventory_store::StoreError;
use crate::jobs::JobError;

pub mod handlers;
pub mod product_master;
pub mod stock_report;
pub mod throttle;

pub use handlers::{ProductMasterExportHandler, StockReportExportHandler};
pub use product_master::stream_product_master;
pub use stock_report::{SkuTotals, StockPivot, stream_stock_report};
pub use throttle::{Throttle, ThrottleConfig};

#[derive(Debug, Error)]
pub enum ExportError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("csv write failed: {0}")]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ExportError {
    /// Attach the output path that was being written.
    pub fn into_job_error(self, path: &Path) -> JobError {
        let path = path.display().to_string();
        match self {
            ExportError::Store(e) => JobError::Transaction(e),
            ExportError::Csv(e) => JobError::io(path, e.into()),
            ExportError::Io(e) => JobError::io(path, e),
        }
    }
}

/// Counters from one streamed export.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExportStats {
    pub rows: u64,
    pub distinct_skus: usize,
    pub pauses: u64,
}

/// Render cents as a decimal amount, e.g. `1250` → `12.50`.
pub fn format_cents(cents: i128) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    format!("{sign}{}.{:02}", abs / 100, abs % 100)
}
