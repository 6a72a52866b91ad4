//! Job queue: types, storage, handler routing, and the polling scheduler.
//!
//! ## Design
//!
//! - Jobs are created PENDING by an external uploader
//! - The scheduler claims one job per tick with a conditional status update
//! - Each job runs inside one inventory transaction, committed on success
//! - Stuck PROCESSING jobs are failed by a sweep, never re-queued
//!
//! ## Components
//!
//! - `Job`: typed job row with payload and result fields
//! - `JobStore`: persistence for jobs (in-memory or Postgres)
//! - `HandlerRegistry`: job type → `JobHandler`
//! - `JobScheduler`: `run_once` sweep/claim/dispatch/finalize

pub mod error;
pub mod postgres;
pub mod registry;
pub mod scheduler;
pub mod store;
pub mod types;

pub use error::JobError;
pub use postgres::PostgresJobStore;
pub use registry::{HandlerRegistry, JobHandler};
pub use scheduler::{JobScheduler, RunOutcome, SchedulerConfig, SchedulerError};
pub use store::{InMemoryJobStore, JobStats, JobStore, JobStoreError};
pub use types::{Job, JobOutcome, JobStatus, JobType};
