//! Sales import: one picking list per invoice.
//!
//! Invoices are independent, so each runs under its own savepoint inside the
//! job transaction. An invoice with a bad line is rolled back on its own and
//! reported; the others still commit. An invoice that already has a picking
//! list for the same channel is skipped.

use std::collections::{BTreeSet, HashMap};

use tracing::{debug, info, instrument};

use pickline_core::ProductId;
use pickline_inventory::{NewPickingListItem, PackageComponent, Product};

use crate::allocation::{EngineError, StockAllocationEngine};
use crate::inventory_store::{InventoryTx, NewPickingList, StoreError};
use crate::jobs::{Job, JobError, JobHandler, JobOutcome};

use super::parser::{ImportParser, SalesChannel, SalesOrder};
use super::report::ImportReport;

pub struct SalesImportHandler<P> {
    channel: SalesChannel,
    parser: P,
    engine: StockAllocationEngine,
}

impl<P: ImportParser> SalesImportHandler<P> {
    pub fn new(channel: SalesChannel, parser: P) -> Self {
        Self {
            channel,
            parser,
            engine: StockAllocationEngine::new(),
        }
    }
}

/// Catalog rows needed by one file, fetched once up front.
struct Catalog {
    products: HashMap<String, Product>,
    components: HashMap<ProductId, Vec<PackageComponent>>,
}

impl Catalog {
    async fn prefetch<T: InventoryTx>(tx: &mut T, orders: &[SalesOrder]) -> Result<Self, JobError> {
        let skus: Vec<String> = orders
            .iter()
            .flat_map(|o| o.lines.iter().map(|l| l.sku.clone()))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let products = tx.products_by_sku(&skus).await?;
        let package_ids: Vec<ProductId> = products
            .values()
            .filter(|p| p.is_package)
            .map(|p| p.id)
            .collect();
        let components = tx.package_components(&package_ids).await?;
        debug!(skus = skus.len(), packages = package_ids.len(), "catalog prefetched");
        Ok(Self {
            products,
            components,
        })
    }

    fn components_of(&self, product: &Product) -> &[PackageComponent] {
        self.components
            .get(&product.id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Why one invoice was not imported.
enum InvoiceError {
    /// Reported against a row; the invoice is rolled back.
    Row { row: usize, sku: String, message: String },
    /// Fails the job.
    Fatal(JobError),
}

#[async_trait::async_trait]
impl<T, P> JobHandler<T> for SalesImportHandler<P>
where
    T: InventoryTx,
    P: ImportParser,
{
    #[instrument(skip(self, job, tx), fields(job_id = %job.id, source = self.channel.source()), err)]
    async fn handle(&self, job: &Job, tx: &mut T) -> Result<JobOutcome, JobError> {
        let path = job.require_file()?;
        let content = tokio::fs::read(path).await.map_err(|e| JobError::io(path, e))?;
        let import = self
            .parser
            .parse_sales(self.channel, &content)
            .map_err(|e| e.in_file(path))?;

        let mut report = ImportReport::with_errors(import.row_errors);
        let catalog = Catalog::prefetch(tx, &import.orders).await?;
        let source = self.channel.source();

        for (n, order) in import.orders.iter().enumerate() {
            if tx.picking_list_exists(source, &order.invoice_no).await? {
                debug!(invoice_no = %order.invoice_no, "invoice already imported");
                report.skipped_count += 1;
                continue;
            }

            // Unknown SKUs are caught before anything is written.
            let unknown: Vec<_> = order
                .lines
                .iter()
                .filter(|l| !catalog.products.contains_key(&l.sku))
                .collect();
            if !unknown.is_empty() {
                for line in unknown {
                    report.error(line.row, Some(&line.sku), format!("unknown SKU {}", line.sku));
                }
                continue;
            }

            let savepoint = format!("invoice_{n}");
            tx.savepoint(&savepoint).await?;
            match self.import_order(tx, job, order, &catalog).await {
                Ok(items) => {
                    tx.release_savepoint(&savepoint).await?;
                    debug!(invoice_no = %order.invoice_no, items, "invoice imported");
                    report.success_count += 1;
                }
                Err(InvoiceError::Row { row, sku, message }) => {
                    tx.rollback_to_savepoint(&savepoint).await?;
                    tx.release_savepoint(&savepoint).await?;
                    report.error(row, Some(&sku), message);
                }
                Err(InvoiceError::Fatal(err)) => return Err(err),
            }
        }

        info!(
            imported = report.success_count,
            skipped = report.skipped_count,
            errors = report.error_rows.len(),
            "sales import finished"
        );
        Ok(report.into_outcome(source, "invoices"))
    }
}

impl<P: ImportParser> SalesImportHandler<P> {
    /// Create the picking list and one item per resolved pick. Package lines
    /// become component items that keep the package SKU as `original_sku`.
    async fn import_order<T: InventoryTx>(
        &self,
        tx: &mut T,
        job: &Job,
        order: &SalesOrder,
        catalog: &Catalog,
    ) -> Result<usize, InvoiceError> {
        let fatal = |e: StoreError| InvoiceError::Fatal(e.into());

        let list_id = tx
            .create_picking_list(&NewPickingList {
                source: self.channel.source().to_string(),
                invoice_no: order.invoice_no.clone(),
                created_by: job.user_id,
            })
            .await
            .map_err(fatal)?;

        let mut items = 0;
        for line in &order.lines {
            let Some(product) = catalog.products.get(&line.sku) else {
                return Err(InvoiceError::Row {
                    row: line.row,
                    sku: line.sku.clone(),
                    message: format!("unknown SKU {}", line.sku),
                });
            };

            let planned = match self
                .engine
                .plan(tx, product, line.quantity, catalog.components_of(product))
                .await
            {
                Ok(planned) => planned,
                Err(EngineError::Store(e)) => return Err(fatal(e)),
                Err(e) => {
                    return Err(InvoiceError::Row {
                        row: line.row,
                        sku: line.sku.clone(),
                        message: e.to_string(),
                    });
                }
            };

            for component in planned {
                for pick in component.picks {
                    let item = NewPickingListItem {
                        product_id: component.demand.product_id,
                        original_sku: line.sku.clone(),
                        quantity: pick.quantity,
                        suggested_location_id: pick.location_id,
                    };
                    tx.insert_picking_item(list_id, &item).await.map_err(fatal)?;
                    items += 1;
                }
            }
        }
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imports::parser::CsvImportParser;
    use crate::inventory_store::{InMemoryInventoryStore, InventoryStore};
    use crate::jobs::JobType;
    use pickline_inventory::LocationPurpose;

    fn write_file(name: &str, content: &str) -> String {
        let dir = std::env::temp_dir().join(format!("pickline-sales-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path.to_string_lossy().into_owned()
    }

    async fn run(store: &InMemoryInventoryStore, channel: SalesChannel, csv: &str) -> JobOutcome {
        let handler = SalesImportHandler::new(channel, CsvImportParser::new());
        let job = Job::new(channel.job_type()).with_file(write_file("sales.csv", csv));
        let mut tx = store.begin().await.unwrap();
        let outcome = handler.handle(&job, &mut tx).await.unwrap();
        tx.commit().await.unwrap();
        outcome
    }

    #[tokio::test]
    async fn bad_invoice_does_not_block_others() {
        let store = InMemoryInventoryStore::new();
        let a = store.add_product("A", "Alpha", 100);
        let l1 = store.add_location("L1", 1, LocationPurpose::Display);
        store.put_stock(a, l1, 10);

        let csv = "invoice_no,sku,quantity\nINV-1,A,2\nINV-2,A,1\nINV-2,NOPE,1\n";
        let outcome = run(&store, SalesChannel::A, csv).await;

        assert_eq!(outcome.summary, "SALES_A: 1 invoices imported, 0 skipped, 1 row errors");
        let lists = store.picking_lists();
        assert_eq!(lists.len(), 1);
        assert_eq!(lists[0].invoice_no, "INV-1");
        let items = store.picking_items();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].suggested_location_id, Some(l1));
        // Importing creates suggestions only.
        assert_eq!(store.stock(a, l1), Some(10));
    }

    #[tokio::test]
    async fn reimport_skips_known_invoices() {
        let store = InMemoryInventoryStore::new();
        store.add_product("A", "Alpha", 100);
        let csv = "invoice_no,sku,quantity\nINV-1,A,2\n";

        run(&store, SalesChannel::B, csv).await;
        let second = run(&store, SalesChannel::B, csv).await;
        assert_eq!(second.summary, "SALES_B: 0 invoices imported, 1 skipped, 0 row errors");

        // Same invoice number on the other channel is a different order.
        let other = run(&store, SalesChannel::A, csv).await;
        assert!(other.summary.starts_with("SALES_A: 1 invoices imported"));
    }

    #[tokio::test]
    async fn unstocked_line_becomes_backorder_item() {
        let store = InMemoryInventoryStore::new();
        store.add_product("A", "Alpha", 100);
        run(&store, SalesChannel::A, "invoice_no,sku,quantity\nINV-9,A,4\n").await;

        let items = store.picking_items();
        assert_eq!(items.len(), 1);
        assert!(items[0].is_backorder());
        assert_eq!(items[0].quantity, 4);
    }

    #[tokio::test]
    async fn nested_package_rolls_back_only_its_invoice() {
        let store = InMemoryInventoryStore::new();
        let c = store.add_product("C", "Component", 10);
        let inner = store.add_package("INNER", "Inner", 20, &[(c, 2)]);
        store.add_package("OUTER", "Outer", 40, &[(inner, 2)]);

        let csv = "invoice_no,sku,quantity\nINV-1,C,1\nINV-1,OUTER,1\nINV-2,INNER,1\n";
        let outcome = run(&store, SalesChannel::A, csv).await;

        assert_eq!(outcome.summary, "SALES_A: 1 invoices imported, 0 skipped, 1 row errors");
        let lists = store.picking_lists();
        assert_eq!(lists.len(), 1);
        assert_eq!(lists[0].invoice_no, "INV-2");
        let items = store.picking_items();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].product_id, c);
        assert_eq!(items[0].original_sku, "INNER");
        assert_eq!(items[0].quantity, 2);
    }

    #[tokio::test]
    async fn unreadable_header_names_the_file() {
        let store = InMemoryInventoryStore::new();
        let path = write_file("sales.csv", "");
        std::fs::write(&path, b"invoice_no,\xff\xfe\nINV-1,A\n").unwrap();
        let handler = SalesImportHandler::new(SalesChannel::A, CsvImportParser::new());
        let job = Job::new(JobType::ImportSalesA).with_file(path.clone());

        let mut tx = store.begin().await.unwrap();
        let err = handler.handle(&job, &mut tx).await.unwrap_err();
        assert!(matches!(err, JobError::Parse { path: ref p, ref message } if *p == path && message.starts_with("header row")));
        assert!(err.to_string().starts_with(&format!("could not parse {path}: header row")));
    }

    #[tokio::test]
    async fn missing_file_fails_the_job() {
        let store = InMemoryInventoryStore::new();
        let handler = SalesImportHandler::new(SalesChannel::A, CsvImportParser::new());
        let job = Job::new(JobType::ImportSalesA).with_file("/nonexistent/pickline/sales.csv");
        let mut tx = store.begin().await.unwrap();
        let err = handler.handle(&job, &mut tx).await.unwrap_err();
        assert!(matches!(err, JobError::Io { .. }));
    }
}
