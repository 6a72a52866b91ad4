//! Default handler set for a worker process.

use std::path::PathBuf;
use std::sync::Arc;

use crate::bulk::{ProductMasterExportHandler, StockReportExportHandler, ThrottleConfig};
use crate::fulfillment::FulfillmentCommitter;
use crate::imports::{
    AttendanceImportHandler, AttendanceImporter, CsvImportParser, SalesChannel, SalesImportHandler,
    StockAdjustmentHandler,
};
use crate::inventory_store::InventoryTx;
use crate::jobs::{HandlerRegistry, JobType};

/// What the standard handlers need from the deployment.
pub struct HandlerDeps<T: InventoryTx> {
    pub export_dir: PathBuf,
    pub throttle: ThrottleConfig,
    pub parser: CsvImportParser,
    /// Attendance rows are only importable when an importer is supplied.
    pub attendance: Option<Arc<dyn AttendanceImporter<T>>>,
}

impl<T: InventoryTx> Default for HandlerDeps<T> {
    fn default() -> Self {
        Self {
            export_dir: PathBuf::default(),
            throttle: ThrottleConfig::default(),
            parser: CsvImportParser::default(),
            attendance: None,
        }
    }
}

impl<T: InventoryTx> Clone for HandlerDeps<T> {
    fn clone(&self) -> Self {
        Self {
            export_dir: self.export_dir.clone(),
            throttle: self.throttle,
            parser: self.parser,
            attendance: self.attendance.clone(),
        }
    }
}

/// Register every built-in handler. `IMPORT_ATTENDANCE` is left out when
/// `deps.attendance` is `None`; check `HandlerRegistry::missing`.
pub fn standard_registry<T: InventoryTx>(deps: HandlerDeps<T>) -> HandlerRegistry<T> {
    let mut registry = HandlerRegistry::new();
    registry
        .register(
            JobType::ImportSalesA,
            SalesImportHandler::new(SalesChannel::A, deps.parser),
        )
        .register(
            JobType::ImportSalesB,
            SalesImportHandler::new(SalesChannel::B, deps.parser),
        )
        .register(
            JobType::AdjustStock,
            StockAdjustmentHandler::new(deps.parser, FulfillmentCommitter::default()),
        )
        .register(
            JobType::ExportStockReport,
            StockReportExportHandler::new(deps.export_dir.clone(), deps.throttle),
        )
        .register(
            JobType::ExportProductMaster,
            ProductMasterExportHandler::new(deps.export_dir, deps.throttle),
        );

    if let Some(importer) = deps.attendance {
        registry.register(
            JobType::ImportAttendance,
            AttendanceImportHandler::new(deps.parser, importer),
        );
    }
    registry
}
