//! Job storage abstraction and the in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;

use pickline_core::JobId;

use super::types::{Job, JobOutcome, JobStatus};
use crate::inventory_store::StoreError;

/// Job store abstraction.
///
/// Every state change is conditional on the current status, so two workers
/// racing on the same row cannot both win.
#[async_trait::async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Enqueue a new pending job (the uploader's write).
    async fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError>;

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Fail every PROCESSING job started before `started_before`; returns their ids.
    async fn fail_stuck(
        &self,
        started_before: DateTime<Utc>,
        message: &str,
    ) -> Result<Vec<JobId>, JobStoreError>;

    /// Oldest PENDING job by creation time, if any. Does not claim it.
    async fn oldest_pending(&self) -> Result<Option<Job>, JobStoreError>;

    /// PENDING → PROCESSING. `false` means another worker got there first
    /// (or the job was cancelled).
    async fn try_lock(&self, job_id: JobId) -> Result<bool, JobStoreError>;

    /// PROCESSING → COMPLETED.
    async fn complete(&self, job_id: JobId, outcome: &JobOutcome) -> Result<bool, JobStoreError>;

    /// PROCESSING → FAILED.
    async fn fail(&self, job_id: JobId, message: &str) -> Result<bool, JobStoreError>;

    /// PENDING → CANCELLED. Claimed jobs cannot be cancelled.
    async fn cancel(&self, job_id: JobId) -> Result<bool, JobStoreError>;

    async fn stats(&self) -> Result<JobStats, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("invalid job state: {0}")]
    InvalidState(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Job counts by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl JobStats {
    pub(crate) fn add(&mut self, status: JobStatus, count: usize) {
        match status {
            JobStatus::Pending => self.pending += count,
            JobStatus::Processing => self.processing += count,
            JobStatus::Completed => self.completed += count,
            JobStatus::Failed => self.failed += count,
            JobStatus::Cancelled => self.cancelled += count,
        }
    }
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Insert a job exactly as given, whatever its status.
    pub fn seed(&self, job: Job) {
        self.jobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job.id, job);
    }

    /// Apply `f` to the job if its status is `from`.
    fn transition(&self, job_id: JobId, from: JobStatus, f: impl FnOnce(&mut Job)) -> bool {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        match jobs.get_mut(&job_id) {
            Some(job) if job.status == from => {
                f(job);
                true
            }
            _ => false,
        }
    }
}

#[async_trait::async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError> {
        if job.status != JobStatus::Pending {
            return Err(JobStoreError::InvalidState(format!(
                "new jobs must be PENDING, got {}",
                job.status.as_str()
            )));
        }
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        let id = job.id;
        jobs.insert(id, job);
        Ok(id)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
        Ok(jobs.get(&job_id).cloned())
    }

    async fn fail_stuck(
        &self,
        started_before: DateTime<Utc>,
        message: &str,
    ) -> Result<Vec<JobId>, JobStoreError> {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        let now = Utc::now();
        let mut swept = Vec::new();
        for job in jobs.values_mut() {
            let stuck = job.status == JobStatus::Processing
                && job.processing_started_at.is_some_and(|at| at < started_before);
            if stuck {
                job.status = JobStatus::Failed;
                job.error_message = Some(message.to_string());
                job.finished_at = Some(now);
                swept.push(job.id);
            }
        }
        Ok(swept)
    }

    async fn oldest_pending(&self) -> Result<Option<Job>, JobStoreError> {
        let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
        // Sort by created_at to keep FIFO; the v7 id breaks ties.
        Ok(jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending)
            .min_by_key(|j| (j.created_at, *j.id.as_uuid()))
            .cloned())
    }

    async fn try_lock(&self, job_id: JobId) -> Result<bool, JobStoreError> {
        Ok(self.transition(job_id, JobStatus::Pending, |job| {
            job.status = JobStatus::Processing;
            job.processing_started_at = Some(Utc::now());
        }))
    }

    async fn complete(&self, job_id: JobId, outcome: &JobOutcome) -> Result<bool, JobStoreError> {
        Ok(self.transition(job_id, JobStatus::Processing, |job| {
            job.status = JobStatus::Completed;
            job.result_summary = Some(outcome.summary.clone());
            job.result_log = outcome.log.clone();
            job.finished_at = Some(Utc::now());
        }))
    }

    async fn fail(&self, job_id: JobId, message: &str) -> Result<bool, JobStoreError> {
        Ok(self.transition(job_id, JobStatus::Processing, |job| {
            job.status = JobStatus::Failed;
            job.error_message = Some(message.to_string());
            job.finished_at = Some(Utc::now());
        }))
    }

    async fn cancel(&self, job_id: JobId) -> Result<bool, JobStoreError> {
        {
            let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
            if !jobs.contains_key(&job_id) {
                return Err(JobStoreError::NotFound(job_id));
            }
        }
        Ok(self.transition(job_id, JobStatus::Pending, |job| {
            job.status = JobStatus::Cancelled;
            job.finished_at = Some(Utc::now());
        }))
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
        let mut stats = JobStats::default();
        for job in jobs.values() {
            stats.add(job.status, 1);
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::JobType;

    #[tokio::test]
    async fn oldest_pending_is_fifo() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let newer = Job::new(JobType::AdjustStock).created_at(now);
        let older = Job::new(JobType::ImportSalesA).created_at(now - chrono::Duration::minutes(5));
        store.enqueue(newer).await.unwrap();
        let older_id = store.enqueue(older).await.unwrap();

        let next = store.oldest_pending().await.unwrap().unwrap();
        assert_eq!(next.id, older_id);
    }

    #[tokio::test]
    async fn lock_is_single_winner() {
        let store = InMemoryJobStore::new();
        let id = store.enqueue(Job::new(JobType::AdjustStock)).await.unwrap();

        assert!(store.try_lock(id).await.unwrap());
        assert!(!store.try_lock(id).await.unwrap());

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert!(job.processing_started_at.is_some());
    }

    #[tokio::test]
    async fn cancel_only_applies_before_claim() {
        let store = InMemoryJobStore::new();
        let waiting = store.enqueue(Job::new(JobType::ExportStockReport)).await.unwrap();
        let running = store.enqueue(Job::new(JobType::ExportStockReport)).await.unwrap();
        store.try_lock(running).await.unwrap();

        assert!(store.cancel(waiting).await.unwrap());
        assert!(!store.cancel(running).await.unwrap());
        let missing = JobId::new();
        assert_eq!(store.cancel(missing).await, Err(JobStoreError::NotFound(missing)));
        assert!(store.oldest_pending().await.unwrap().is_none());

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.cancelled, 1);
        assert_eq!(stats.processing, 1);
    }

    #[tokio::test]
    async fn complete_and_fail_require_processing() {
        let store = InMemoryJobStore::new();
        let id = store.enqueue(Job::new(JobType::AdjustStock)).await.unwrap();

        assert!(!store.complete(id, &JobOutcome::new("done")).await.unwrap());
        store.try_lock(id).await.unwrap();
        assert!(store.complete(id, &JobOutcome::new("done")).await.unwrap());
        assert!(!store.fail(id, "late failure").await.unwrap());

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result_summary.as_deref(), Some("done"));
        assert!(job.error_message.is_none());
    }

    #[tokio::test]
    async fn enqueue_rejects_non_pending_and_duplicates() {
        let store = InMemoryJobStore::new();
        let mut job = Job::new(JobType::AdjustStock);
        store.enqueue(job.clone()).await.unwrap();
        assert_eq!(
            store.enqueue(job.clone()).await,
            Err(JobStoreError::AlreadyExists(job.id))
        );

        job.id = JobId::new();
        job.status = JobStatus::Completed;
        assert!(matches!(
            store.enqueue(job).await,
            Err(JobStoreError::InvalidState(_))
        ));
    }
}
