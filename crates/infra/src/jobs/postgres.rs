//! Postgres-backed job store.
//!
//! The `jobs` table is the queue. Claiming is a conditional
//! `UPDATE … WHERE status = 'PENDING'`; whichever worker's update touches the
//! row owns the job.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use pickline_core::{JobId, UserId};

use super::store::{JobStats, JobStore, JobStoreError};
use super::types::{Job, JobOutcome, JobStatus, JobType};
use crate::db::map_sqlx_error;
use crate::inventory_store::StoreError;

const JOB_COLUMNS: &str = "id, job_type, status, payload, file_path, user_id, created_at, \
     processing_started_at, finished_at, result_summary, result_log, error_message";

#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait::async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id, job_type = %job.job_type), err)]
    async fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError> {
        if job.status != JobStatus::Pending {
            return Err(JobStoreError::InvalidState(format!(
                "new jobs must be PENDING, got {}",
                job.status.as_str()
            )));
        }

        let result = sqlx::query(
            r#"
            INSERT INTO jobs (id, job_type, status, payload, file_path, user_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.job_type.as_str())
        .bind(job.status.as_str())
        .bind(&job.payload)
        .bind(job.file_path.as_deref())
        .bind(job.user_id.map(|u| u.get()))
        .bind(job.created_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("enqueue_job", e))?;

        if result.rows_affected() == 0 {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        Ok(job.id)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;

        Ok(row.as_ref().map(job_from_row).transpose()?)
    }

    #[instrument(skip(self, message), err)]
    async fn fail_stuck(
        &self,
        started_before: DateTime<Utc>,
        message: &str,
    ) -> Result<Vec<JobId>, JobStoreError> {
        let rows = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'FAILED', error_message = $2, finished_at = NOW()
            WHERE status = 'PROCESSING'
              AND processing_started_at < $1
            RETURNING id
            "#,
        )
        .bind(started_before)
        .bind(message)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fail_stuck_jobs", e))?;

        rows.iter()
            .map(|row| {
                let id: Uuid = row
                    .try_get("id")
                    .map_err(|e| StoreError::Decode(format!("column id: {e}")))?;
                Ok(JobId::from_uuid(id))
            })
            .collect()
    }

    async fn oldest_pending(&self) -> Result<Option<Job>, JobStoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE status = 'PENDING' ORDER BY created_at ASC, id ASC LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("oldest_pending_job", e))?;

        Ok(row.as_ref().map(job_from_row).transpose()?)
    }

    async fn try_lock(&self, job_id: JobId) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'PROCESSING', processing_started_at = NOW()
            WHERE id = $1 AND status = 'PENDING'
            "#,
        )
        .bind(job_id.as_uuid())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("lock_job", e))?;

        Ok(result.rows_affected() == 1)
    }

    async fn complete(&self, job_id: JobId, outcome: &JobOutcome) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'COMPLETED',
                result_summary = $2,
                result_log = $3,
                error_message = NULL,
                finished_at = NOW()
            WHERE id = $1 AND status = 'PROCESSING'
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(&outcome.summary)
        .bind(outcome.log.as_ref())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("complete_job", e))?;

        Ok(result.rows_affected() == 1)
    }

    async fn fail(&self, job_id: JobId, message: &str) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'FAILED', error_message = $2, finished_at = NOW()
            WHERE id = $1 AND status = 'PROCESSING'
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(message)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fail_job", e))?;

        Ok(result.rows_affected() == 1)
    }

    async fn cancel(&self, job_id: JobId) -> Result<bool, JobStoreError> {
        let row = sqlx::query(
            r#"
            WITH target AS (SELECT id, status FROM jobs WHERE id = $1),
            cancelled AS (
                UPDATE jobs
                SET status = 'CANCELLED', finished_at = NOW()
                WHERE id = $1 AND status = 'PENDING'
                RETURNING id
            )
            SELECT
                EXISTS (SELECT 1 FROM target) AS present,
                EXISTS (SELECT 1 FROM cancelled) AS cancelled
            "#,
        )
        .bind(job_id.as_uuid())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("cancel_job", e))?;

        let present: bool = decode(&row, "present")?;
        if !present {
            return Err(JobStoreError::NotFound(job_id));
        }
        Ok(decode(&row, "cancelled")?)
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM jobs GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("job_stats", e))?;

        let mut stats = JobStats::default();
        for row in &rows {
            let status: String = decode(row, "status")?;
            let count: i64 = decode(row, "n")?;
            let status: JobStatus = status
                .parse()
                .map_err(|e| StoreError::Decode(format!("job status: {e}")))?;
            stats.add(status, usize::try_from(count).unwrap_or(0));
        }
        Ok(stats)
    }
}

fn decode<'r, T>(row: &'r PgRow, column: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(column)
        .map_err(|e| StoreError::Decode(format!("column {column}: {e}")))
}

fn job_from_row(row: &PgRow) -> Result<Job, StoreError> {
    let job_type: String = decode(row, "job_type")?;
    let status: String = decode(row, "status")?;

    Ok(Job {
        id: JobId::from_uuid(decode(row, "id")?),
        job_type: job_type
            .parse::<JobType>()
            .map_err(|e| StoreError::Decode(e.to_string()))?,
        status: status
            .parse::<JobStatus>()
            .map_err(|e| StoreError::Decode(e.to_string()))?,
        payload: decode(row, "payload")?,
        file_path: decode(row, "file_path")?,
        user_id: decode::<Option<i64>>(row, "user_id")?.map(UserId::new),
        created_at: decode(row, "created_at")?,
        processing_started_at: decode(row, "processing_started_at")?,
        finished_at: decode(row, "finished_at")?,
        result_summary: decode(row, "result_summary")?,
        result_log: decode(row, "result_log")?,
        error_message: decode(row, "error_message")?,
    })
}
