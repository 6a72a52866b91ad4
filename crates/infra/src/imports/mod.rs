//! File import handlers.
//!
//! Each handler reads the job's uploaded file, hands it to an `ImportParser`,
//! and writes the result through the job transaction. Atomicity per job type:
//!
//! - sales (`IMPORT_SALES_A`, `IMPORT_SALES_B`): per invoice, via savepoints
//! - `ADJUST_STOCK`: whole file
//! - `IMPORT_ATTENDANCE`: whole file, delegated to an `AttendanceImporter`

pub mod adjust;
pub mod attendance;
pub mod parser;
pub mod report;
pub mod sales;

pub use adjust::StockAdjustmentHandler;
pub use attendance::{AttendanceImportHandler, AttendanceImporter};
pub use parser::{
    AdjustmentImport, AttendanceImport, AttendanceRecord, CsvImportParser, ImportParser, SalesChannel,
    SalesImport, SalesLine, SalesOrder, StockAdjustment,
};
pub use report::{ImportReport, RowError};
pub use sales::SalesImportHandler;
