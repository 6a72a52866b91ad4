use thiserror::Error;

use crate::allocation::EngineError;
use crate::fulfillment::FulfillmentError;
use crate::inventory_store::StoreError;

/// Why a job failed. The message ends up in the job's `error_message`.
#[derive(Debug, Error)]
pub enum JobError {
    /// Input the job cannot work with as a whole (rows are reported, not raised).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A database operation failed mid-job; the job transaction is rolled back.
    #[error("transaction failed: {0}")]
    Transaction(#[from] StoreError),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("could not parse {path}: {message}")]
    Parse { path: String, message: String },

    /// The header row could not be read. Parsers only see bytes; handlers
    /// attach the file with [`JobError::in_file`].
    #[error("unreadable header row: {0}")]
    Header(String),

    #[error("i/o error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("bad job payload: {0}")]
    Payload(String),

    #[error("no handler registered for {0}")]
    NoHandler(String),
}

impl JobError {
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        JobError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn parse(path: impl Into<String>, message: impl Into<String>) -> Self {
        JobError::Parse {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Name the file a parser error came from.
    pub fn in_file(self, path: &str) -> Self {
        match self {
            JobError::Header(message) => JobError::parse(path, format!("header row: {message}")),
            other => other,
        }
    }
}

impl From<EngineError> for JobError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Store(e) => JobError::Transaction(e),
            other => JobError::Validation(other.to_string()),
        }
    }
}

impl From<FulfillmentError> for JobError {
    fn from(err: FulfillmentError) -> Self {
        match err {
            FulfillmentError::Store(e) => JobError::Transaction(e),
            other => JobError::Validation(other.to_string()),
        }
    }
}
