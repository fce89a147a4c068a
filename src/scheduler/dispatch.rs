use std::sync::Arc;

use crate::context;
use crate::error::{DispatchError, Result};
use crate::producer::JobProducer;
use crate::registry::Registry;
use crate::scheduler::job::{FailureReason, Job, JobStatus};

/// Hands jobs to the producers registered on this node.
pub struct LocalDispatcher {
    registry: Arc<dyn Registry>,
    producers: Vec<Arc<dyn JobProducer>>,
}

impl LocalDispatcher {
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self {
            registry,
            producers: Vec::new(),
        }
    }

    /// Register a producer
    pub fn register(&mut self, producer: Arc<dyn JobProducer>) {
        tracing::info!(job_type = %producer.job_type(), "Producer registered");
        self.producers.push(producer);
    }

    pub fn with_producer(mut self, producer: Arc<dyn JobProducer>) -> Self {
        self.register(producer);
        self
    }

    /// Offer a job to every producer of its type, in registration order.
    ///
    /// Returns `Ok(true)` once a producer accepted the job. If none does, the
    /// job goes back to the queue and `Ok(false)` is returned. A producer
    /// declaring the job undispatchable fails it for good.
    pub async fn dispatch(&self, job: &Job) -> Result<bool> {
        let mut job = self.registry.get_job(job.id).await?;
        job.set_status(JobStatus::Dispatching)?;
        let mut job = self.registry.update_job(&job).await?;

        let job_type = job.job_type.clone();
        let candidates = self.producers.iter().filter(|p| p.job_type() == job_type);

        for producer in candidates {
            if !producer.is_ready_to_accept_jobs(&job.operation) {
                tracing::debug!(job_id = %job.id, operation = %job.operation, "Producer not ready for operation");
                continue;
            }

            match producer.is_ready_to_accept(&job).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e @ DispatchError::Undispatchable(_)) => {
                    job.set_status_with_reason(JobStatus::Failed, FailureReason::Data)?;
                    self.registry.update_job(&job).await?;
                    tracing::warn!(job_id = %job.id, error = %e, "Producer refused job");
                    return Err(e);
                }
                Err(e) => return Err(e),
            }

            // the job being handed over is the current job of the accepting side
            let scoped = context::current().with_job(job.clone());
            match context::scope(scoped, producer.accept_job(job.clone())).await {
                Ok(()) => {
                    tracing::info!(job_id = %job.id, job_type = %job.job_type, "Job dispatched");
                    return Ok(true);
                }
                Err(DispatchError::WorkersExhausted(max)) => {
                    tracing::debug!(job_id = %job.id, max, "Producer out of workers");
                    job = self.registry.get_job(job.id).await?;
                }
                Err(e) => return Err(e),
            }
        }

        job.set_status(JobStatus::Queued)?;
        self.registry.update_job(&job).await?;
        tracing::debug!(job_id = %job.id, "No producer ready, job queued again");
        Ok(false)
    }
}
