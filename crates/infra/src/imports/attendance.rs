//! Attendance import.
//!
//! Parsing happens here; what the records mean (shifts, overtime) belongs to
//! an `AttendanceImporter` supplied by the deployment.

use std::sync::Arc;

use tracing::{info, instrument};

use crate::inventory_store::InventoryTx;
use crate::jobs::{Job, JobError, JobHandler, JobOutcome};

use super::parser::{AttendanceRecord, ImportParser};
use super::report::ImportReport;

/// Persists parsed attendance records.
///
/// Called once per job with every well-formed row and the job's transaction.
/// Writes go through `tx`, so an `Err` fails the job and rolls them back.
#[async_trait::async_trait]
pub trait AttendanceImporter<T: InventoryTx>: Send + Sync {
    async fn import(&self, job: &Job, records: Vec<AttendanceRecord>, tx: &mut T) -> Result<ImportReport, JobError>;
}

pub struct AttendanceImportHandler<P, T: InventoryTx> {
    parser: P,
    importer: Arc<dyn AttendanceImporter<T>>,
}

impl<P: ImportParser, T: InventoryTx> AttendanceImportHandler<P, T> {
    pub fn new(parser: P, importer: Arc<dyn AttendanceImporter<T>>) -> Self {
        Self { parser, importer }
    }
}

#[async_trait::async_trait]
impl<T, P> JobHandler<T> for AttendanceImportHandler<P, T>
where
    T: InventoryTx,
    P: ImportParser,
{
    #[instrument(skip(self, job, tx), fields(job_id = %job.id), err)]
    async fn handle(&self, job: &Job, tx: &mut T) -> Result<JobOutcome, JobError> {
        let path = job.require_file()?;
        let content = tokio::fs::read(path).await.map_err(|e| JobError::io(path, e))?;
        let import = self.parser.parse_attendance(&content).map_err(|e| e.in_file(path))?;

        let mut report = self.importer.import(job, import.records, tx).await?;
        report.error_rows.extend(import.row_errors);

        info!(imported = report.success_count, errors = report.error_rows.len(), "attendance import finished");
        Ok(report.into_outcome(job.job_type.as_str(), "records"))
    }
}
