//! Integration tests for the full job pipeline.
//!
//! Tests: JobStore → JobScheduler → handler → InventoryTx → FulfillmentCommitter
//!
//! Verifies:
//! - A sales import queued as a job produces the expected picks
//! - Completing the picks deducts stock and writes one movement per deduction
//! - A failing batch leaves stock and the ledger untouched
//! - Exports and adjustments run through the same scheduler

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};
    use std::sync::Arc;

    use pickline_core::{LocationId, ProductId, UserId};
    use pickline_inventory::{LocationPurpose, MovementType};

    use crate::bulk::ThrottleConfig;
    use crate::fulfillment::FulfillmentCommitter;
    use crate::imports::{AttendanceImporter, AttendanceRecord, ImportReport};
    use crate::inventory_store::{InMemoryInventoryStore, InMemoryInventoryTx, InventoryTx, ProductChanges};
    use crate::jobs::{
        InMemoryJobStore, Job, JobError, JobScheduler, JobStatus, JobStore, JobType, RunOutcome, SchedulerConfig,
    };
    use crate::wiring::{HandlerDeps, standard_registry};

    struct Warehouse {
        store: InMemoryInventoryStore,
        a: ProductId,
        c: ProductId,
        l1: LocationId,
        l2: LocationId,
    }

    /// A: 10 at L1 (floor 1). B: package of 3 × C. C: 20 at L2 (floor 3).
    fn warehouse() -> Warehouse {
        let store = InMemoryInventoryStore::new();
        let a = store.add_product("A", "Alpha", 500);
        let c = store.add_product("C", "Component", 100);
        store.add_package("B", "Bundle", 250, &[(c, 3)]);
        let l1 = store.add_location("L1", 1, LocationPurpose::Display);
        let l2 = store.add_location("L2", 3, LocationPurpose::Display);
        store.put_stock(a, l1, 10);
        store.put_stock(c, l2, 20);
        Warehouse { store, a, c, l1, l2 }
    }

    fn work_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("pickline-it-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn scheduler(
        store: &InMemoryInventoryStore,
        dir: &Path,
    ) -> JobScheduler<InMemoryJobStore, InMemoryInventoryStore> {
        scheduler_with(store, HandlerDeps {
            export_dir: dir.join("exports"),
            throttle: ThrottleConfig::default(),
            ..Default::default()
        })
    }

    fn scheduler_with(
        store: &InMemoryInventoryStore,
        deps: HandlerDeps<InMemoryInventoryTx>,
    ) -> JobScheduler<InMemoryJobStore, InMemoryInventoryStore> {
        let registry = standard_registry(deps);
        JobScheduler::new(InMemoryJobStore::arc(), store.clone(), registry, SchedulerConfig::default())
    }

    async fn run_job(scheduler: &JobScheduler<InMemoryJobStore, InMemoryInventoryStore>, job: Job) -> Job {
        let id = scheduler.jobs().enqueue(job).await.unwrap();
        let outcome = scheduler.run_once().await.unwrap();
        assert!(matches!(outcome, RunOutcome::Completed(done) if done == id), "{outcome:?}");
        scheduler.jobs().get(id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn sales_import_then_commit_moves_stock() {
        let w = warehouse();
        let dir = work_dir();
        let scheduler = scheduler(&w.store, &dir);

        let file = dir.join("sales.csv");
        std::fs::write(&file, "invoice_no,sku,quantity\nINV-100,A,2\nINV-100,B,5\n").unwrap();
        let job = run_job(
            &scheduler,
            Job::new(JobType::ImportSalesA).with_file(file.to_string_lossy()),
        )
        .await;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(
            job.result_summary.as_deref(),
            Some("SALES_A: 1 invoices imported, 0 skipped, 0 row errors")
        );

        let items = w.store.picking_items();
        assert_eq!(items.len(), 2);
        let a_item = items.iter().find(|i| i.product_id == w.a).unwrap();
        assert_eq!((a_item.suggested_location_id, a_item.quantity), (Some(w.l1), 2));
        let c_item = items.iter().find(|i| i.product_id == w.c).unwrap();
        assert_eq!((c_item.suggested_location_id, c_item.quantity), (Some(w.l2), 15));
        assert_eq!(c_item.original_sku, "B");

        // Import only suggests; nothing has moved yet.
        assert!(w.store.movements().is_empty());

        let ids: Vec<_> = items.iter().map(|i| i.id).collect();
        let report = FulfillmentCommitter::default()
            .complete_items(&w.store, &ids, UserId::new(1))
            .await
            .unwrap();
        assert!(report.success);

        let movements = w.store.movements();
        assert_eq!(movements.len(), 2);
        assert!(movements.iter().all(|m| m.movement.movement_type == MovementType::Sale));
        assert_eq!(w.store.stock(w.a, w.l1), Some(8));
        assert_eq!(w.store.stock(w.c, w.l2), Some(5));
    }

    #[tokio::test]
    async fn unresolvable_item_rolls_back_the_whole_batch() {
        let w = warehouse();
        let dir = work_dir();
        let scheduler = scheduler(&w.store, &dir);

        // A is fully stocked; C is not (30 requested, 20 on hand).
        let file = dir.join("sales.csv");
        std::fs::write(&file, "invoice_no,sku,quantity\nINV-1,A,1\nINV-2,B,10\n").unwrap();
        run_job(&scheduler, Job::new(JobType::ImportSalesB).with_file(file.to_string_lossy())).await;

        let ids: Vec<_> = w.store.picking_items().iter().map(|i| i.id).collect();
        let report = FulfillmentCommitter::default()
            .complete_items(&w.store, &ids, UserId::new(1))
            .await
            .unwrap();

        assert!(!report.success);
        assert!(w.store.movements().is_empty());
        assert_eq!(w.store.stock(w.a, w.l1), Some(10));
        assert_eq!(w.store.stock(w.c, w.l2), Some(20));
    }

    #[tokio::test]
    async fn adjustment_then_export_reflects_new_counts() {
        let w = warehouse();
        let dir = work_dir();
        let scheduler = scheduler(&w.store, &dir);

        let file = dir.join("counts.csv");
        std::fs::write(&file, "sku,location,quantity\nA,L1,12\nC,L2,20\n").unwrap();
        let adjusted = run_job(
            &scheduler,
            Job::new(JobType::AdjustStock)
                .with_file(file.to_string_lossy())
                .with_user(UserId::new(3)),
        )
        .await;
        assert_eq!(
            adjusted.result_summary.as_deref(),
            Some("ADJUST_STOCK: 2 rows imported, 0 skipped, 0 row errors")
        );
        // Unchanged counts write nothing.
        assert_eq!(w.store.movements().len(), 1);

        let export = run_job(&scheduler, Job::new(JobType::ExportStockReport)).await;
        let summary = dir.join("exports").join(format!("stock_summary_{}.csv", export.id));
        let pivot = std::fs::read_to_string(summary).unwrap();
        assert!(pivot.contains("A,Alpha,12,,12,60.00"));
        assert!(pivot.contains("C,Component,,20,20,20.00"));
    }

    #[tokio::test]
    async fn attendance_without_importer_fails_cleanly() {
        let w = warehouse();
        let dir = work_dir();
        let scheduler = scheduler(&w.store, &dir);
        let jobs: Arc<InMemoryJobStore> = scheduler.jobs().clone();

        let id = jobs
            .enqueue(Job::new(JobType::ImportAttendance).with_file("unused.csv"))
            .await
            .unwrap();
        assert_eq!(scheduler.run_once().await.unwrap(), RunOutcome::Failed(id));

        let job = jobs.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(
            job.error_message.as_deref(),
            Some("no handler registered for IMPORT_ATTENDANCE")
        );
        assert_eq!(scheduler.run_once().await.unwrap(), RunOutcome::Idle);
    }

    /// Writes through the job transaction, then rejects the batch.
    struct RenameThenFail(ProductId);

    #[async_trait::async_trait]
    impl AttendanceImporter<InMemoryInventoryTx> for RenameThenFail {
        async fn import(
            &self,
            _job: &Job,
            records: Vec<AttendanceRecord>,
            tx: &mut InMemoryInventoryTx,
        ) -> Result<ImportReport, JobError> {
            let changes = ProductChanges {
                name: Some(format!("touched by {} records", records.len())),
                ..Default::default()
            };
            tx.update_product(self.0, &changes).await?;
            Err(JobError::Validation("unknown employee E1".to_string()))
        }
    }

    #[tokio::test]
    async fn failed_attendance_batch_keeps_none_of_its_writes() {
        let w = warehouse();
        let dir = work_dir();
        let scheduler = scheduler_with(&w.store, HandlerDeps {
            export_dir: dir.join("exports"),
            attendance: Some(Arc::new(RenameThenFail(w.a))),
            ..Default::default()
        });

        let file = dir.join("attendance.csv");
        std::fs::write(&file, "employee_code,date,clock_in,clock_out\nE1,2024-03-01,08:00,17:00\n").unwrap();
        let id = scheduler
            .jobs()
            .enqueue(Job::new(JobType::ImportAttendance).with_file(file.to_string_lossy()))
            .await
            .unwrap();
        assert_eq!(scheduler.run_once().await.unwrap(), RunOutcome::Failed(id));

        let job = scheduler.jobs().get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(w.store.product(w.a).unwrap().name, "Alpha");
    }
}
