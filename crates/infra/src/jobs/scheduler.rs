//! Polling job scheduler.
//!
//! One `run_once` call: sweep stuck jobs, claim the oldest pending job, run its
//! handler inside a fresh inventory transaction, then record the outcome.
//! Cross-process exclusion comes from the conditional PENDING → PROCESSING
//! update; the in-process guard only stops overlapping ticks.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use pickline_core::JobId;

use crate::inventory_store::{InventoryStore, InventoryTx, StoreError};

use super::error::JobError;
use super::registry::HandlerRegistry;
use super::store::{JobStore, JobStoreError};
use super::types::{Job, JobOutcome};

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// PROCESSING jobs older than this are failed by the sweep.
    pub job_timeout: Duration,
    /// Name for logging
    pub name: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            job_timeout: Duration::from_secs(15 * 60),
            name: "job-scheduler".to_string(),
        }
    }
}

impl SchedulerConfig {
    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// What a single `run_once` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// A previous run on this scheduler was still in progress.
    Busy,
    /// No pending job.
    Idle,
    /// Another worker claimed the job between select and lock.
    LostRace(JobId),
    Completed(JobId),
    Failed(JobId),
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    /// No transaction could be opened for a claimed job. Not retried.
    #[error("cannot start job {job_id}: {source}")]
    FatalSetup {
        job_id: JobId,
        #[source]
        source: StoreError,
    },

    /// The job table itself could not be read or updated.
    #[error(transparent)]
    JobStore(#[from] JobStoreError),
}

/// Clears the running flag when the run ends, however it ends.
struct RunGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> RunGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

pub struct JobScheduler<J: JobStore, S: InventoryStore> {
    jobs: Arc<J>,
    inventory: S,
    registry: HandlerRegistry<S::Tx>,
    config: SchedulerConfig,
    running: AtomicBool,
}

impl<J: JobStore, S: InventoryStore> JobScheduler<J, S> {
    pub fn new(jobs: Arc<J>, inventory: S, registry: HandlerRegistry<S::Tx>, config: SchedulerConfig) -> Self {
        Self {
            jobs,
            inventory,
            registry,
            config,
            running: AtomicBool::new(false),
        }
    }

    pub fn registry(&self) -> &HandlerRegistry<S::Tx> {
        &self.registry
    }

    pub fn jobs(&self) -> &Arc<J> {
        &self.jobs
    }

    /// Run at most one job.
    pub async fn run_once(&self) -> Result<RunOutcome, SchedulerError> {
        let Some(_guard) = RunGuard::acquire(&self.running) else {
            debug!(scheduler = %self.config.name, "previous run still in progress");
            return Ok(RunOutcome::Busy);
        };

        self.sweep_stuck().await?;

        let Some(job) = self.jobs.oldest_pending().await? else {
            return Ok(RunOutcome::Idle);
        };

        if !self.jobs.try_lock(job.id).await? {
            info!(job_id = %job.id, job_type = %job.job_type, "job claimed by another worker");
            return Ok(RunOutcome::LostRace(job.id));
        }
        info!(job_id = %job.id, job_type = %job.job_type, "job claimed");

        let mut tx = match self.inventory.begin().await {
            Ok(tx) => tx,
            Err(source) => {
                error!(job_id = %job.id, job_type = %job.job_type, error = %source, "cannot open transaction for job");
                // Best effort so the row does not sit in PROCESSING until the sweep.
                if let Err(e) = self.jobs.fail(job.id, &source.to_string()).await {
                    warn!(job_id = %job.id, error = %e, "could not mark job failed");
                }
                return Err(SchedulerError::FatalSetup {
                    job_id: job.id,
                    source,
                });
            }
        };

        let result = self.dispatch(&job, &mut tx).await;
        let result = match result {
            Ok(outcome) => match tx.commit().await {
                Ok(()) => Ok(outcome),
                Err(e) => Err(JobError::Transaction(e)),
            },
            Err(err) => {
                if let Err(e) = tx.rollback().await {
                    warn!(job_id = %job.id, error = %e, "rollback failed");
                }
                Err(err)
            }
        };

        match result {
            Ok(outcome) => {
                if !self.jobs.complete(job.id, &outcome).await? {
                    warn!(job_id = %job.id, "job left PROCESSING before completion was recorded");
                }
                info!(job_id = %job.id, job_type = %job.job_type, summary = %outcome.summary, "job completed");
                Ok(RunOutcome::Completed(job.id))
            }
            Err(err) => {
                let message = err.to_string();
                if !self.jobs.fail(job.id, &message).await? {
                    warn!(job_id = %job.id, "job left PROCESSING before failure was recorded");
                }
                error!(job_id = %job.id, job_type = %job.job_type, error = %message, "job failed");
                Ok(RunOutcome::Failed(job.id))
            }
        }
    }

    async fn dispatch(&self, job: &Job, tx: &mut S::Tx) -> Result<JobOutcome, JobError> {
        let Some(handler) = self.registry.get(job.job_type) else {
            return Err(JobError::NoHandler(job.job_type.to_string()));
        };
        handler.handle(job, tx).await
    }

    async fn sweep_stuck(&self) -> Result<(), SchedulerError> {
        let timeout = chrono::Duration::from_std(self.config.job_timeout)
            .unwrap_or_else(|_| chrono::Duration::minutes(15));
        let cutoff = Utc::now() - timeout;
        let message = JobError::Timeout(format!(
            "still processing after {}s",
            self.config.job_timeout.as_secs()
        ))
        .to_string();

        for job_id in self.jobs.fail_stuck(cutoff, &message).await? {
            warn!(job_id = %job_id, "stuck job marked failed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory_store::{InMemoryInventoryStore, InMemoryInventoryTx};
    use crate::jobs::registry::JobHandler;
    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::types::{JobStatus, JobType};
    use pickline_inventory::LocationPurpose;

    struct Succeed;

    #[async_trait::async_trait]
    impl JobHandler<InMemoryInventoryTx> for Succeed {
        async fn handle(&self, job: &Job, _tx: &mut InMemoryInventoryTx) -> Result<JobOutcome, JobError> {
            tokio::task::yield_now().await;
            Ok(JobOutcome::new(format!("ran {}", job.job_type)))
        }
    }

    /// Writes stock, then fails; the write must not survive.
    struct WriteThenFail {
        product: pickline_core::ProductId,
        location: pickline_core::LocationId,
    }

    #[async_trait::async_trait]
    impl JobHandler<InMemoryInventoryTx> for WriteThenFail {
        async fn handle(&self, _job: &Job, tx: &mut InMemoryInventoryTx) -> Result<JobOutcome, JobError> {
            tx.adjust_stock(self.product, self.location, -5).await?;
            Err(JobError::Validation("sheet has conflicting rows".to_string()))
        }
    }

    fn scheduler(
        inventory: InMemoryInventoryStore,
        registry: HandlerRegistry<InMemoryInventoryTx>,
    ) -> JobScheduler<InMemoryJobStore, InMemoryInventoryStore> {
        JobScheduler::new(InMemoryJobStore::arc(), inventory, registry, SchedulerConfig::default())
    }

    fn all_succeed() -> HandlerRegistry<InMemoryInventoryTx> {
        let mut registry = HandlerRegistry::new();
        for t in JobType::ALL {
            registry.register(t, Succeed);
        }
        registry
    }

    #[tokio::test]
    async fn empty_queue_is_idle() {
        let s = scheduler(InMemoryInventoryStore::new(), all_succeed());
        assert_eq!(s.run_once().await.unwrap(), RunOutcome::Idle);
    }

    #[tokio::test]
    async fn stuck_job_is_failed_before_claiming() {
        let s = scheduler(InMemoryInventoryStore::new(), all_succeed());

        let mut stuck = Job::new(JobType::ImportSalesA);
        stuck.status = JobStatus::Processing;
        stuck.processing_started_at = Some(Utc::now() - chrono::Duration::minutes(20));
        let stuck_id = stuck.id;
        s.jobs().seed(stuck);

        let mut recent = Job::new(JobType::ImportSalesB);
        recent.status = JobStatus::Processing;
        recent.processing_started_at = Some(Utc::now() - chrono::Duration::minutes(5));
        let recent_id = recent.id;
        s.jobs().seed(recent);

        let pending = s.jobs().enqueue(Job::new(JobType::AdjustStock)).await.unwrap();

        assert_eq!(s.run_once().await.unwrap(), RunOutcome::Completed(pending));

        let stuck = s.jobs().get(stuck_id).await.unwrap().unwrap();
        assert_eq!(stuck.status, JobStatus::Failed);
        assert!(stuck.error_message.unwrap().starts_with("timed out"));
        let recent = s.jobs().get(recent_id).await.unwrap().unwrap();
        assert_eq!(recent.status, JobStatus::Processing);
    }

    #[tokio::test]
    async fn completed_job_records_summary() {
        let s = scheduler(InMemoryInventoryStore::new(), all_succeed());
        let id = s.jobs().enqueue(Job::new(JobType::ExportStockReport)).await.unwrap();

        assert_eq!(s.run_once().await.unwrap(), RunOutcome::Completed(id));
        let job = s.jobs().get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result_summary.as_deref(), Some("ran EXPORT_STOCK_REPORT"));
        assert!(job.finished_at.is_some());
        assert_eq!(s.run_once().await.unwrap(), RunOutcome::Idle);
    }

    #[tokio::test]
    async fn handler_error_fails_job_and_rolls_back() {
        let inventory = InMemoryInventoryStore::new();
        let product = inventory.add_product("A", "Alpha", 100);
        let location = inventory.add_location("L1", 1, LocationPurpose::Display);
        inventory.put_stock(product, location, 10);

        let mut registry = HandlerRegistry::new();
        registry.register(JobType::AdjustStock, WriteThenFail { product, location });
        let s = scheduler(inventory.clone(), registry);

        let id = s.jobs().enqueue(Job::new(JobType::AdjustStock)).await.unwrap();
        assert_eq!(s.run_once().await.unwrap(), RunOutcome::Failed(id));

        let job = s.jobs().get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error_message.unwrap().contains("conflicting rows"));
        assert_eq!(inventory.stock(product, location), Some(10));
    }

    #[tokio::test]
    async fn unregistered_type_fails_with_clear_message() {
        let s = scheduler(InMemoryInventoryStore::new(), HandlerRegistry::new());
        assert!(s.registry().missing().contains(&JobType::ImportAttendance));
        let id = s.jobs().enqueue(Job::new(JobType::ImportAttendance)).await.unwrap();

        assert_eq!(s.run_once().await.unwrap(), RunOutcome::Failed(id));
        let job = s.jobs().get(id).await.unwrap().unwrap();
        assert_eq!(
            job.error_message.as_deref(),
            Some("no handler registered for IMPORT_ATTENDANCE")
        );
    }

    #[tokio::test]
    async fn begin_failure_is_fatal_and_surfaced() {
        let inventory = InMemoryInventoryStore::new();
        inventory.set_unavailable(true);
        let s = scheduler(inventory, all_succeed());
        let id = s.jobs().enqueue(Job::new(JobType::AdjustStock)).await.unwrap();

        let err = s.run_once().await.unwrap_err();
        assert!(matches!(err, SchedulerError::FatalSetup { job_id, .. } if job_id == id));
        let job = s.jobs().get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn overlapping_runs_are_refused() {
        let s = scheduler(InMemoryInventoryStore::new(), all_succeed());
        let id = s.jobs().enqueue(Job::new(JobType::AdjustStock)).await.unwrap();

        let (first, second) = tokio::join!(s.run_once(), s.run_once());
        assert_eq!(first.unwrap(), RunOutcome::Completed(id));
        assert_eq!(second.unwrap(), RunOutcome::Busy);
    }

    #[tokio::test]
    async fn cancelled_job_is_never_claimed() {
        let s = scheduler(InMemoryInventoryStore::new(), all_succeed());
        let id = s.jobs().enqueue(Job::new(JobType::AdjustStock)).await.unwrap();
        assert!(s.jobs().cancel(id).await.unwrap());

        assert_eq!(s.run_once().await.unwrap(), RunOutcome::Idle);
        assert_eq!(s.jobs().get(id).await.unwrap().unwrap().status, JobStatus::Cancelled);
    }

    /// Claims the job behind the scheduler's back, like a second worker would.
    struct RacingStore(InMemoryJobStore);

    #[async_trait::async_trait]
    impl JobStore for RacingStore {
        async fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError> {
            self.0.enqueue(job).await
        }
        async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
            self.0.get(job_id).await
        }
        async fn fail_stuck(
            &self,
            started_before: chrono::DateTime<Utc>,
            message: &str,
        ) -> Result<Vec<JobId>, JobStoreError> {
            self.0.fail_stuck(started_before, message).await
        }
        async fn oldest_pending(&self) -> Result<Option<Job>, JobStoreError> {
            let job = self.0.oldest_pending().await?;
            if let Some(job) = &job {
                self.0.try_lock(job.id).await?;
            }
            Ok(job)
        }
        async fn try_lock(&self, job_id: JobId) -> Result<bool, JobStoreError> {
            self.0.try_lock(job_id).await
        }
        async fn complete(&self, job_id: JobId, outcome: &JobOutcome) -> Result<bool, JobStoreError> {
            self.0.complete(job_id, outcome).await
        }
        async fn fail(&self, job_id: JobId, message: &str) -> Result<bool, JobStoreError> {
            self.0.fail(job_id, message).await
        }
        async fn cancel(&self, job_id: JobId) -> Result<bool, JobStoreError> {
            self.0.cancel(job_id).await
        }
        async fn stats(&self) -> Result<crate::jobs::store::JobStats, JobStoreError> {
            self.0.stats().await
        }
    }

    #[tokio::test]
    async fn losing_the_lock_race_is_a_no_op() {
        let jobs = Arc::new(RacingStore(InMemoryJobStore::new()));
        let s = JobScheduler::new(
            Arc::clone(&jobs),
            InMemoryInventoryStore::new(),
            all_succeed(),
            SchedulerConfig::default(),
        );
        let id = jobs.enqueue(Job::new(JobType::AdjustStock)).await.unwrap();

        assert_eq!(s.run_once().await.unwrap(), RunOutcome::LostRace(id));
        let job = jobs.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert!(job.result_summary.is_none());
    }
}
