//! Components that receive and process jobs of one job type.
//!
//! [`JobProducer`] is the contract the dispatch side talks to. Most producers
//! implement only [`JobProcessor`], the job specific work, and get the
//! producer behavior (admission control, background execution, failure
//! recording) from [`JobDispatcher`].

pub mod dispatcher;

use async_trait::async_trait;

use crate::error::Result;
use crate::scheduler::{Job, JobStatus};

pub use dispatcher::{DispatcherStats, JobDispatcher, StatsSnapshot};

#[async_trait]
pub trait JobProducer: Send + Sync {
    /// The job type this producer handles.
    fn job_type(&self) -> &str;

    /// Number of this producer's jobs in `status`; `None` is an error.
    async fn count_jobs(&self, status: Option<JobStatus>) -> Result<u64>;

    /// Take over a job. Returns once the job is persisted as running; the
    /// processing itself happens in the background.
    async fn accept_job(&self, job: Job) -> Result<()>;

    /// Coarse readiness, e.g. false while in maintenance.
    fn is_ready_to_accept_jobs(&self, _operation: &str) -> bool {
        true
    }

    /// Whether this node should take `job` now. `Ok(false)` means "not now",
    /// [`crate::error::DispatchError::Undispatchable`] means "never".
    async fn is_ready_to_accept(&self, job: &Job) -> Result<bool>;
}

/// The job specific part of a producer.
#[async_trait]
pub trait JobProcessor: Send + Sync + 'static {
    fn job_type(&self) -> &str;

    /// Do the work, returning the payload to store on the finished job.
    ///
    /// Returning [`crate::error::DispatchError::Canceled`] reports cooperative
    /// cancellation rather than failure.
    async fn process(&self, job: &Job) -> Result<Option<String>>;

    fn is_ready_to_accept_jobs(&self, _operation: &str) -> bool {
        true
    }

    /// Producer specific admission check run before the load check. Return
    /// `Undispatchable` for jobs this producer can never take.
    async fn check_admission(&self, _job: &Job) -> Result<()> {
        Ok(())
    }
}
