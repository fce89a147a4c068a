use std::time::Duration;

use thiserror::Error;

use crate::scheduler::job::{JobId, JobStatus};

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Stale update of job {id}: presented version {presented}, stored version {stored}")]
    VersionConflict {
        id: JobId,
        presented: u64,
        stored: u64,
    },

    #[error("Registry error: a job status must be provided")]
    MissingStatus,

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Job can never be dispatched: {0}")]
    Undispatchable(String),

    #[error("Job {0} was canceled")]
    Canceled(JobId),

    #[error("Timed out after {0:?} waiting for jobs")]
    Timeout(Duration),

    #[error("Illegal status transition for job {id}: {from} -> {to}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("All {0} worker slots are busy")]
    WorkersExhausted(usize),

    #[error("Dispatcher is shutting down")]
    ShuttingDown,

    #[error("Wait for jobs was aborted")]
    WaitAborted,

    #[error("Identity error: {0}")]
    Identity(String),

    #[error("Processing failed: {0}")]
    Processing(String),

    #[error("Waiting for jobs failed: {0}")]
    WaitFailed(#[source] Box<DispatchError>),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DispatchError {
    /// True for errors raised by the job store, including optimistic lock failures.
    pub fn is_registry_error(&self) -> bool {
        matches!(
            self,
            DispatchError::Registry(_)
                | DispatchError::VersionConflict { .. }
                | DispatchError::MissingStatus
        )
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, DispatchError::Canceled(_))
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;
