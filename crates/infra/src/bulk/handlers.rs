//! Job handlers for the export job types.
//!
//! Outputs are written as `<name>.part` next to their final path and renamed
//! once complete, so a reader never sees a half-written export.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde_json::json;
use tracing::{info, instrument};

use crate::inventory_store::{InventoryTx, ProductMasterFilter, StockReportFilter};
use crate::jobs::{Job, JobError, JobHandler, JobOutcome};

use super::product_master::stream_product_master;
use super::stock_report::stream_stock_report;
use super::throttle::ThrottleConfig;

/// An export file being written under a temporary name.
struct PartFile {
    path: PathBuf,
    part: PathBuf,
    writer: BufWriter<File>,
    finished: bool,
}

impl PartFile {
    async fn create(path: PathBuf) -> Result<Self, JobError> {
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| JobError::io(dir.display().to_string(), e))?;
        }
        let mut part = path.clone().into_os_string();
        part.push(".part");
        let part = PathBuf::from(part);
        let file = File::create(&part).map_err(|e| JobError::io(part.display().to_string(), e))?;
        Ok(Self {
            path,
            part,
            writer: BufWriter::new(file),
            finished: false,
        })
    }

    async fn finish(mut self) -> Result<PathBuf, JobError> {
        self.writer
            .flush()
            .map_err(|e| JobError::io(self.part.display().to_string(), e))?;
        tokio::fs::rename(&self.part, &self.path)
            .await
            .map_err(|e| JobError::io(self.path.display().to_string(), e))?;
        self.finished = true;
        Ok(self.path.clone())
    }
}

impl Drop for PartFile {
    fn drop(&mut self) {
        if !self.finished {
            let _ = std::fs::remove_file(&self.part);
        }
    }
}

fn display(path: &Path) -> String {
    path.display().to_string()
}

/// `EXPORT_STOCK_REPORT`: raw rows to `stock_report_<job>.csv`, the per-SKU
/// pivot to `stock_summary_<job>.csv`. Payload: `StockReportFilter`.
pub struct StockReportExportHandler {
    export_dir: PathBuf,
    throttle: ThrottleConfig,
}

impl StockReportExportHandler {
    pub fn new(export_dir: impl Into<PathBuf>, throttle: ThrottleConfig) -> Self {
        Self {
            export_dir: export_dir.into(),
            throttle,
        }
    }
}

#[async_trait::async_trait]
impl<T: InventoryTx> JobHandler<T> for StockReportExportHandler {
    #[instrument(skip(self, job, tx), fields(job_id = %job.id), err)]
    async fn handle(&self, job: &Job, tx: &mut T) -> Result<JobOutcome, JobError> {
        let filter: StockReportFilter = job.payload_as()?;
        let mut raw = PartFile::create(self.export_dir.join(format!("stock_report_{}.csv", job.id))).await?;
        let mut summary =
            PartFile::create(self.export_dir.join(format!("stock_summary_{}.csv", job.id))).await?;

        let stats = stream_stock_report(tx, &filter, &mut raw.writer, &mut summary.writer, self.throttle)
            .await
            .map_err(|e| e.into_job_error(&raw.path))?;

        let raw_path = raw.finish().await?;
        let summary_path = summary.finish().await?;
        info!(
            rows = stats.rows,
            skus = stats.distinct_skus,
            raw = %raw_path.display(),
            summary = %summary_path.display(),
            "stock report exported"
        );

        Ok(JobOutcome::new(format!(
            "{}: {} rows, {} SKUs",
            job.job_type, stats.rows, stats.distinct_skus
        ))
        .with_log(json!({
            "files": [display(&raw_path), display(&summary_path)],
            "stats": stats,
        })))
    }
}

/// `EXPORT_PRODUCT_MASTER`: the catalog to `product_master_<job>.csv`.
/// Payload: `ProductMasterFilter`.
pub struct ProductMasterExportHandler {
    export_dir: PathBuf,
    throttle: ThrottleConfig,
}

impl ProductMasterExportHandler {
    pub fn new(export_dir: impl Into<PathBuf>, throttle: ThrottleConfig) -> Self {
        Self {
            export_dir: export_dir.into(),
            throttle,
        }
    }
}

#[async_trait::async_trait]
impl<T: InventoryTx> JobHandler<T> for ProductMasterExportHandler {
    #[instrument(skip(self, job, tx), fields(job_id = %job.id), err)]
    async fn handle(&self, job: &Job, tx: &mut T) -> Result<JobOutcome, JobError> {
        let filter: ProductMasterFilter = job.payload_as()?;
        let mut out = PartFile::create(self.export_dir.join(format!("product_master_{}.csv", job.id))).await?;

        let stats = stream_product_master(tx, &filter, &mut out.writer, self.throttle)
            .await
            .map_err(|e| e.into_job_error(&out.path))?;

        let path = out.finish().await?;
        info!(rows = stats.rows, file = %path.display(), "product master exported");

        Ok(JobOutcome::new(format!("{}: {} products", job.job_type, stats.rows))
            .with_log(json!({ "files": [display(&path)], "stats": stats })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory_store::{InMemoryInventoryStore, InventoryStore};
    use crate::jobs::JobType;
    use pickline_inventory::LocationPurpose;

    fn export_dir() -> PathBuf {
        std::env::temp_dir().join(format!("pickline-export-{}", uuid::Uuid::now_v7()))
    }

    #[tokio::test]
    async fn stock_report_writes_both_files() {
        let store = InMemoryInventoryStore::new();
        let a = store.add_product("A", "Alpha", 100);
        let l1 = store.add_location("L1", 1, LocationPurpose::Display);
        store.put_stock(a, l1, 4);

        let dir = export_dir();
        let handler = StockReportExportHandler::new(&dir, ThrottleConfig::default());
        let job = Job::new(JobType::ExportStockReport);
        let mut tx = store.begin().await.unwrap();
        let outcome = handler.handle(&job, &mut tx).await.unwrap();

        assert_eq!(outcome.summary, "EXPORT_STOCK_REPORT: 1 rows, 1 SKUs");
        let raw = dir.join(format!("stock_report_{}.csv", job.id));
        let summary = dir.join(format!("stock_summary_{}.csv", job.id));
        assert!(raw.exists());
        assert!(std::fs::read_to_string(&summary).unwrap().contains("A,Alpha,4,4,4.00"));

        let leftovers = std::fs::read_dir(&dir)
            .unwrap()
            .filter(|e| e.as_ref().unwrap().path().extension().is_some_and(|x| x == "part"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn bad_filter_payload_fails_before_writing() {
        let store = InMemoryInventoryStore::new();
        let dir = export_dir();
        let handler = ProductMasterExportHandler::new(&dir, ThrottleConfig::default());
        let job = Job::new(JobType::ExportProductMaster)
            .with_payload(serde_json::json!({ "active_only": "sometimes" }));
        let mut tx = store.begin().await.unwrap();

        let err = handler.handle(&job, &mut tx).await.unwrap_err();
        assert!(matches!(err, JobError::Payload(_)));
        assert!(!dir.exists());
    }
}
