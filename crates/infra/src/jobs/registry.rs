//! Job-type → handler routing.

use std::collections::HashMap;
use std::sync::Arc;

use crate::inventory_store::InventoryTx;

use super::error::JobError;
use super::types::{Job, JobOutcome, JobType};

/// Runs one job inside the transaction the scheduler opened for it.
///
/// Returning `Ok` commits the transaction; returning `Err` rolls it back and
/// fails the job with the error's message.
#[async_trait::async_trait]
pub trait JobHandler<T: InventoryTx>: Send + Sync {
    async fn handle(&self, job: &Job, tx: &mut T) -> Result<JobOutcome, JobError>;
}

/// Handler lookup keyed by job type.
pub struct HandlerRegistry<T: InventoryTx> {
    handlers: HashMap<JobType, Arc<dyn JobHandler<T>>>,
}

impl<T: InventoryTx> HandlerRegistry<T> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register (or replace) the handler for a job type.
    pub fn register<H>(&mut self, job_type: JobType, handler: H) -> &mut Self
    where
        H: JobHandler<T> + 'static,
    {
        self.handlers.insert(job_type, Arc::new(handler));
        self
    }

    pub fn get(&self, job_type: JobType) -> Option<Arc<dyn JobHandler<T>>> {
        self.handlers.get(&job_type).cloned()
    }

    /// Job types with no handler, in declaration order.
    pub fn missing(&self) -> Vec<JobType> {
        JobType::ALL
            .into_iter()
            .filter(|t| !self.handlers.contains_key(t))
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.missing().is_empty()
    }
}

impl<T: InventoryTx> Default for HandlerRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: InventoryTx> std::fmt::Debug for HandlerRegistry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut registered: Vec<&str> = self.handlers.keys().map(|t| t.as_str()).collect();
        registered.sort_unstable();
        f.debug_struct("HandlerRegistry")
            .field("registered", &registered)
            .finish()
    }
}
