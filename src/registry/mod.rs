//! The job registry: the single authoritative store of jobs.
//!
//! Every job mutation goes through [`Registry::update_job`], which enforces
//! optimistic versioning. The registry also reports the load figures used for
//! admission control and collects incidents raised while processing jobs.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context;
use crate::error::{DispatchError, Result};
use crate::scheduler::{Job, JobId, JobStatus};

pub use memory::InMemoryRegistry;

/// Load figures of one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeLoad {
    pub host: String,
    pub current_load: f32,
    pub max_load: f32,
}

#[async_trait]
pub trait Registry: Send + Sync {
    async fn get_job(&self, id: JobId) -> Result<Job>;

    /// Persist `job`. The stored version must equal `job.version()`; the
    /// returned copy carries the bumped version.
    async fn update_job(&self, job: &Job) -> Result<Job>;

    /// Number of jobs of `job_type` currently in `status`.
    async fn count(&self, job_type: &str, status: JobStatus) -> Result<u64>;

    async fn max_load_on_node(&self, host: &str) -> Result<NodeLoad>;

    /// Load already committed on this node.
    async fn own_load(&self) -> Result<f32>;

    /// Name this registry's node is known under.
    fn hostname(&self) -> &str;

    fn incidents(&self) -> &dyn Incidents;

    /// The job the calling task works on behalf of, if any.
    fn current_job(&self) -> Option<Job> {
        context::current_job()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Info,
    Warning,
    Failure,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Failure => write!(f, "failure"),
        }
    }
}

/// A diagnostic record attached to a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub id: Uuid,
    pub job_id: JobId,
    pub job_type: String,
    pub operation: String,
    pub severity: Severity,
    pub message: String,
    /// The error chain, outermost first.
    pub details: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl Incident {
    pub fn from_error(job: &Job, severity: Severity, error: &DispatchError) -> Self {
        let mut details = Vec::new();
        let mut source: Option<&dyn std::error::Error> = std::error::Error::source(error);
        while let Some(err) = source {
            details.push(err.to_string());
            source = err.source();
        }
        Self {
            id: Uuid::new_v4(),
            job_id: job.id,
            job_type: job.job_type.clone(),
            operation: job.operation.clone(),
            severity,
            message: error.to_string(),
            details,
            timestamp: Utc::now(),
        }
    }
}

#[async_trait]
pub trait Incidents: Send + Sync {
    /// Record an error that escaped processing of `job`.
    async fn unhandled_exception(
        &self,
        job: &Job,
        severity: Severity,
        error: &DispatchError,
    ) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incident_keeps_error_chain() {
        let job = Job::new("composer", "encode");
        let error = DispatchError::WaitFailed(Box::new(DispatchError::Registry(
            "connection reset".into(),
        )));
        let incident = Incident::from_error(&job, Severity::Failure, &error);

        assert_eq!(incident.job_id, job.id);
        assert_eq!(incident.operation, "encode");
        assert_eq!(incident.severity, Severity::Failure);
        assert!(incident.message.contains("connection reset"));
        assert_eq!(incident.details, vec!["Registry error: connection reset"]);
    }
}
