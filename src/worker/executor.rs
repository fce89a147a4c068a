use std::sync::Arc;

use crate::context::{self, ExecutionContext};
use crate::error::{DispatchError, Result};
use crate::identity::IdentityProvider;
use crate::producer::{DispatcherStats, JobProcessor};
use crate::registry::{Registry, Severity};
use crate::scheduler::{FailureReason, Job, JobId, JobStatus};

/// Result of running one accepted job.
#[derive(Debug)]
pub struct ExecutionResult {
    pub job_id: JobId,
    /// The terminal status the job was left in.
    pub status: JobStatus,
    pub payload: Option<String>,
    pub error: Option<String>,
}

impl ExecutionResult {
    fn finished(job_id: JobId, payload: Option<String>) -> Self {
        Self {
            job_id,
            status: JobStatus::Finished,
            payload,
            error: None,
        }
    }

    fn failed(job_id: JobId, error: &DispatchError) -> Self {
        Self {
            job_id,
            status: JobStatus::Failed,
            payload: None,
            error: Some(error.to_string()),
        }
    }
}

/// Everything a worker needs to run a job, handed over explicitly.
#[derive(Clone)]
pub struct WorkerContext {
    pub registry: Arc<dyn Registry>,
    pub identity: Arc<dyn IdentityProvider>,
    pub processor: Arc<dyn JobProcessor>,
    pub stats: Arc<DispatcherStats>,
}

/// Run a job that has already been persisted as running.
///
/// `initiator` is the job the accepting task was working for; it becomes the
/// current job while this one runs. Nothing is returned to the submitter:
/// failures end up as a failed job plus an incident.
pub async fn run_job(ctx: WorkerContext, job_id: JobId, initiator: Option<JobId>) -> ExecutionResult {
    let current_job = match initiator {
        Some(id) => match ctx.registry.get_job(id).await {
            Ok(job) => Some(job),
            Err(e) => {
                tracing::warn!(job_id = %job_id, initiator = %id, error = %e, "Unable to load initiating job");
                None
            }
        },
        None => None,
    };

    let scoped = ExecutionContext {
        current_job,
        identity: None,
    };
    context::scope(scoped, execute(&ctx, job_id)).await
}

async fn execute(ctx: &WorkerContext, job_id: JobId) -> ExecutionResult {
    let job = match ctx.registry.get_job(job_id).await {
        Ok(job) => job,
        Err(e) => {
            tracing::error!(job_id = %job_id, error = %e, "Unable to load accepted job, it stays running");
            ctx.stats.record_lost_update();
            return ExecutionResult::failed(job_id, &e);
        }
    };

    tracing::info!(job_id = %job_id, job_type = %job.job_type, operation = %job.operation, "Processing job");

    let outcome = match process_as_creator(ctx, &job).await {
        Ok(payload) => complete(ctx, job_id, payload).await,
        Err(e) => Err(e),
    };

    match outcome {
        Ok(result) if result.status == JobStatus::Finished => {
            ctx.stats.record_finished();
            tracing::info!(job_id = %job_id, operation = %job.operation, "Job finished");
            result
        }
        Ok(result) => result,
        Err(e) if e.is_cancellation() => {
            ctx.stats.record_canceled();
            tracing::info!(job_id = %job_id, operation = %job.operation, "Job processing was canceled");
            ExecutionResult {
                job_id,
                status: JobStatus::Canceled,
                payload: None,
                error: None,
            }
        }
        Err(e) => fail(ctx, job, e).await,
    }
}

/// Invoke the processor under the identity of the job's creator.
///
/// The identity lives in a scope around the processing call only, and the
/// call runs on its own task so that a panic is reported as a failure.
async fn process_as_creator(ctx: &WorkerContext, job: &Job) -> Result<Option<String>> {
    let identity = ctx.identity.resolve(job).await?;
    let scoped = context::current().with_identity(identity);

    let processor = Arc::clone(&ctx.processor);
    let job = job.clone();
    let handle = tokio::spawn(context::scope(scoped, async move {
        processor.process(&job).await
    }));

    match handle.await {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(DispatchError::Processing(format!(
            "processing panicked: {e}"
        ))),
        Err(e) => Err(DispatchError::Internal(format!("processing task failed: {e}"))),
    }
}

/// Store the payload on a fresh copy, the processor may have touched the job.
/// A job terminated in the meantime keeps its status and gets no payload.
async fn complete(ctx: &WorkerContext, job_id: JobId, payload: Option<String>) -> Result<ExecutionResult> {
    let mut job = ctx.registry.get_job(job_id).await?;
    match job.status() {
        JobStatus::Canceled => return Err(DispatchError::Canceled(job_id)),
        status if status.is_terminated() => {
            tracing::info!(job_id = %job_id, status = %status, "Job terminated during processing, dropping its result");
            return Ok(ExecutionResult {
                job_id,
                status,
                payload: job.payload,
                error: None,
            });
        }
        _ => {}
    }
    job.payload = payload;
    job.set_status(JobStatus::Finished)?;
    let job = ctx.registry.update_job(&job).await?;
    Ok(ExecutionResult::finished(job_id, job.payload))
}

async fn fail(ctx: &WorkerContext, job: Job, error: DispatchError) -> ExecutionResult {
    let job_id = job.id;
    tracing::error!(job_id = %job_id, operation = %job.operation, error = %error, "Error processing job");
    ctx.stats.record_failed();

    let job = match mark_failed(ctx.registry.as_ref(), job_id).await {
        Ok(job) => job,
        Err(e) => {
            tracing::error!(job_id = %job_id, error = %e, "Unable to mark job as failed");
            ctx.stats.record_lost_update();
            job
        }
    };

    if let Err(e) = ctx
        .registry
        .incidents()
        .unhandled_exception(&job, Severity::Failure, &error)
        .await
    {
        tracing::error!(job_id = %job_id, error = %e, "Unable to record incident");
        ctx.stats.record_lost_update();
    }

    ExecutionResult::failed(job_id, &error)
}

async fn mark_failed(registry: &dyn Registry, job_id: JobId) -> Result<Job> {
    let mut job = registry.get_job(job_id).await?;
    job.set_status_with_reason(JobStatus::Failed, FailureReason::Processing)?;
    registry.update_job(&job).await
}
