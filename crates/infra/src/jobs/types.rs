//! Core job types.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use pickline_core::{JobId, UserId};

use super::error::JobError;

/// The fixed set of job types the worker knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    /// Sales report from marketplace channel A.
    ImportSalesA,
    /// Sales report from marketplace channel B.
    ImportSalesB,
    /// Stock count / catalog adjustment sheet.
    AdjustStock,
    ImportAttendance,
    ExportProductMaster,
    ExportStockReport,
}

impl JobType {
    pub const ALL: [JobType; 6] = [
        JobType::ImportSalesA,
        JobType::ImportSalesB,
        JobType::AdjustStock,
        JobType::ImportAttendance,
        JobType::ExportProductMaster,
        JobType::ExportStockReport,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::ImportSalesA => "IMPORT_SALES_A",
            JobType::ImportSalesB => "IMPORT_SALES_B",
            JobType::AdjustStock => "ADJUST_STOCK",
            JobType::ImportAttendance => "IMPORT_ATTENDANCE",
            JobType::ExportProductMaster => "EXPORT_PRODUCT_MASTER",
            JobType::ExportStockReport => "EXPORT_STOCK_REPORT",
        }
    }
}

impl core::fmt::Display for JobType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| JobError::Payload(format!("unknown job type: {s}")))
    }
}

/// Job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    /// Withdrawn before any worker claimed it.
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
        }
    }
}

impl FromStr for JobStatus {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(JobStatus::Pending),
            "PROCESSING" => Ok(JobStatus::Processing),
            "COMPLETED" => Ok(JobStatus::Completed),
            "FAILED" => Ok(JobStatus::Failed),
            "CANCELLED" => Ok(JobStatus::Cancelled),
            other => Err(JobError::Payload(format!("unknown job status: {other}"))),
        }
    }
}

/// A queued unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub job_type: JobType,
    pub status: JobStatus,
    /// Filters/options; shape depends on `job_type`.
    pub payload: serde_json::Value,
    /// Uploaded file for import jobs.
    pub file_path: Option<String>,
    pub user_id: Option<UserId>,
    pub created_at: DateTime<Utc>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result_summary: Option<String>,
    pub result_log: Option<serde_json::Value>,
    pub error_message: Option<String>,
}

impl Job {
    /// A new pending job with an empty payload.
    pub fn new(job_type: JobType) -> Self {
        Self {
            id: JobId::new(),
            job_type,
            status: JobStatus::Pending,
            payload: serde_json::Value::Object(Default::default()),
            file_path: None,
            user_id: None,
            created_at: Utc::now(),
            processing_started_at: None,
            finished_at: None,
            result_summary: None,
            result_log: None,
            error_message: None,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_file(mut self, path: impl Into<String>) -> Self {
        self.file_path = Some(path.into());
        self
    }

    pub fn with_user(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self
    }

    /// Decode the payload into a typed options struct.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, JobError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| JobError::Payload(format!("{} payload: {e}", self.job_type)))
    }

    pub fn require_file(&self) -> Result<&str, JobError> {
        self.file_path
            .as_deref()
            .ok_or_else(|| JobError::Payload(format!("{} job has no file_path", self.job_type)))
    }
}

/// What a handler reports on success.
#[derive(Debug, Clone, PartialEq)]
pub struct JobOutcome {
    /// One-line human-readable summary.
    pub summary: String,
    /// Optional structured detail (row errors, output files, counters).
    pub log: Option<serde_json::Value>,
}

impl JobOutcome {
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            log: None,
        }
    }

    pub fn with_log(mut self, log: serde_json::Value) -> Self {
        self.log = Some(log);
        self
    }
}
