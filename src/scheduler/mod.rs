pub mod admission;
pub mod dispatch;
pub mod job;

pub use admission::Admission;
pub use dispatch::LocalDispatcher;
pub use job::{FailureReason, Job, JobId, JobStatus};
