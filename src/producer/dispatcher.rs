use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::DispatcherConfig;
use crate::context;
use crate::error::{DispatchError, Result};
use crate::identity::IdentityProvider;
use crate::producer::{JobProcessor, JobProducer};
use crate::registry::Registry;
use crate::scheduler::admission::{self, Admission};
use crate::scheduler::{FailureReason, Job, JobStatus};
use crate::worker::{self, WorkerContext};

/// Counters kept by a dispatcher and its workers.
#[derive(Debug, Default)]
pub struct DispatcherStats {
    accepted: AtomicU64,
    rejected: AtomicU64,
    finished: AtomicU64,
    failed: AtomicU64,
    canceled: AtomicU64,
    lost_updates: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub rejected: u64,
    pub finished: u64,
    pub failed: u64,
    pub canceled: u64,
    /// Registry writes lost inside workers, where no caller can see the error.
    pub lost_updates: u64,
}

impl DispatcherStats {
    pub(crate) fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_finished(&self) {
        self.finished.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_canceled(&self) {
        self.canceled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_lost_update(&self) {
        self.lost_updates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            finished: self.finished.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            canceled: self.canceled.load(Ordering::Relaxed),
            lost_updates: self.lost_updates.load(Ordering::Relaxed),
        }
    }
}

/// Producer behavior shared by all job types: load based admission and
/// background execution on a bounded set of workers.
pub struct JobDispatcher {
    processor: Arc<dyn JobProcessor>,
    registry: Arc<dyn Registry>,
    identity: Arc<dyn IdentityProvider>,
    config: DispatcherConfig,
    workers: Arc<Semaphore>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    stats: Arc<DispatcherStats>,
}

impl JobDispatcher {
    pub fn new(
        processor: Arc<dyn JobProcessor>,
        registry: Arc<dyn Registry>,
        identity: Arc<dyn IdentityProvider>,
        config: DispatcherConfig,
    ) -> Self {
        let workers = Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1)));
        Self {
            processor,
            registry,
            identity,
            config,
            workers,
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            stats: Arc::new(DispatcherStats::default()),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Jobs currently being processed.
    pub fn running_jobs(&self) -> usize {
        self.tracker.len()
    }

    /// Mark a job failed unless it finished.
    ///
    /// For producers that run their own completion logic and could not tell
    /// the outcome. Jobs already in another terminal status are left alone.
    pub async fn finally_update(&self, job: &Job) -> Result<Job> {
        let mut current = self.registry.get_job(job.id).await?;
        match current.status() {
            JobStatus::Finished => Ok(current),
            status if status.is_terminated() => {
                tracing::debug!(job_id = %job.id, status = %status, "Job already terminated, not marking it failed");
                Ok(current)
            }
            _ => {
                current.set_status_with_reason(JobStatus::Failed, FailureReason::Processing)?;
                let failed = self.registry.update_job(&current).await?;
                tracing::warn!(job_id = %job.id, operation = %job.operation, "Job did not finish, marked as failed");
                Ok(failed)
            }
        }
    }

    /// Stop accepting jobs and wait for running ones to finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tracker.close();
        tracing::info!(running = self.tracker.len(), job_type = %self.processor.job_type(), "Draining dispatcher");
        self.tracker.wait().await;
    }

    fn worker_context(&self) -> WorkerContext {
        WorkerContext {
            registry: Arc::clone(&self.registry),
            identity: Arc::clone(&self.identity),
            processor: Arc::clone(&self.processor),
            stats: Arc::clone(&self.stats),
        }
    }
}

#[async_trait]
impl JobProducer for JobDispatcher {
    fn job_type(&self) -> &str {
        self.processor.job_type()
    }

    async fn count_jobs(&self, status: Option<JobStatus>) -> Result<u64> {
        let status = status.ok_or(DispatchError::MissingStatus)?;
        self.registry.count(self.job_type(), status).await
    }

    async fn accept_job(&self, mut job: Job) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(DispatchError::ShuttingDown);
        }
        let permit = Arc::clone(&self.workers)
            .try_acquire_owned()
            .map_err(|_| DispatchError::WorkersExhausted(self.config.max_concurrent_jobs))?;

        job.set_status(JobStatus::Running)?;
        let job = self.registry.update_job(&job).await?;
        self.stats.record_accepted();

        let initiator = context::current_job().map(|j| j.id);
        let ctx = self.worker_context();
        let job_id = job.id;
        self.tracker.spawn(async move {
            let _permit = permit;
            let result = worker::run_job(ctx, job_id, initiator).await;
            tracing::debug!(job_id = %result.job_id, status = %result.status, "Worker done");
        });

        tracing::info!(job_id = %job_id, operation = %job.operation, load = job.job_load(), "Job accepted");
        Ok(())
    }

    fn is_ready_to_accept_jobs(&self, operation: &str) -> bool {
        if self.shutdown.is_cancelled() {
            return false;
        }
        if self.workers.available_permits() == 0 {
            tracing::debug!(operation, "All workers busy");
            return false;
        }
        self.processor.is_ready_to_accept_jobs(operation)
    }

    async fn is_ready_to_accept(&self, job: &Job) -> Result<bool> {
        if job.job_type != self.job_type() {
            tracing::debug!(job_id = %job.id, job_type = %job.job_type, "Job type not handled by this producer");
            return Ok(false);
        }

        self.processor.check_admission(job).await?;

        let hostname = self.registry.hostname().to_string();
        let max_load = self.registry.max_load_on_node(&hostname).await?.max_load;
        let current_load = self.registry.own_load().await?;

        match admission::decide(
            job.job_load(),
            max_load,
            current_load,
            self.config.accept_exceeding_max_load,
        ) {
            Admission::AcceptExceeding => {
                tracing::warn!(
                    job_id = %job.id,
                    job_load = job.job_load(),
                    max_load,
                    host = %hostname,
                    "Accepting job whose load exceeds the node's maximum load"
                );
                Ok(true)
            }
            Admission::Reject => {
                self.stats.record_rejected();
                tracing::debug!(
                    job_id = %job.id,
                    job_load = job.job_load(),
                    current_load,
                    max_load,
                    "Declining job, node would be overloaded"
                );
                Ok(false)
            }
            Admission::Accept => {
                tracing::debug!(
                    job_id = %job.id,
                    projected_load = current_load + job.job_load(),
                    max_load,
                    "Accepting job"
                );
                Ok(true)
            }
        }
    }
}
