//! Waiting for a set of jobs to terminate.
//!
//! Jobs may run on any node, so there is no in-process event to wait on. A
//! [`JobBarrier`] polls the registry instead, from one poller task per wait.
//! The poller stops when every job is terminal, when one job is canceled, when
//! the deadline passes, or when the wait is aborted through its cancellation
//! token; the deadline and the token share the poller's single exit path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::BarrierConfig;
use crate::error::{DispatchError, Result};
use crate::registry::Registry;
use crate::scheduler::{Job, JobId, JobStatus};

const MIN_POLLING_INTERVAL: Duration = Duration::from_millis(1);

/// Terminal statuses collected by a barrier.
#[derive(Debug, Default)]
pub struct BarrierResult {
    statuses: HashMap<JobId, JobStatus>,
    payloads: HashMap<JobId, String>,
    failures: Vec<DispatchError>,
}

impl BarrierResult {
    /// True iff every job finished. Vacuously true for no jobs.
    pub fn is_success(&self) -> bool {
        self.statuses.values().all(|s| *s == JobStatus::Finished)
    }

    pub fn statuses(&self) -> &HashMap<JobId, JobStatus> {
        &self.statuses
    }

    pub fn status_of(&self, id: &JobId) -> Option<JobStatus> {
        self.statuses.get(id).copied()
    }

    /// Payload the job carried when it was seen terminal.
    pub fn payload(&self, id: &JobId) -> Option<&str> {
        self.payloads.get(id).map(String::as_str)
    }

    /// The first recoverable error met while waiting, e.g. a vanished job.
    pub fn failure(&self) -> Option<&DispatchError> {
        self.failures.first()
    }

    pub fn failures(&self) -> &[DispatchError] {
        &self.failures
    }

    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }

    fn record(&mut self, id: JobId, status: JobStatus, payload: Option<String>) {
        self.statuses.insert(id, status);
        if let Some(payload) = payload {
            self.payloads.insert(id, payload);
        }
    }
}

/// Blocks until a set of jobs reached a terminal status.
///
/// [`JobBarrier::wait_for_jobs`] consumes the barrier: a barrier is waited on
/// once, and its job set is fixed from then on.
pub struct JobBarrier {
    registry: Arc<dyn Registry>,
    jobs: Vec<JobId>,
    waiter: Option<JobId>,
    polling_interval: Duration,
    cancellation: CancellationToken,
}

impl JobBarrier {
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self {
            registry,
            jobs: Vec::new(),
            waiter: None,
            polling_interval: BarrierConfig::default().polling_interval,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn for_jobs<I>(registry: Arc<dyn Registry>, jobs: I) -> Self
    where
        I: IntoIterator<Item = JobId>,
    {
        let mut barrier = Self::new(registry);
        for id in jobs {
            barrier.add_job(id);
        }
        barrier
    }

    pub fn with_config(mut self, config: &BarrierConfig) -> Self {
        self.polling_interval = config.polling_interval;
        self
    }

    pub fn with_polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = interval;
        self
    }

    /// The job the waiting caller runs as. It is parked in `Waiting` for the
    /// duration of the wait so it is not mistaken for busy work.
    pub fn with_waiter(mut self, waiter: &Job) -> Self {
        self.waiter = Some(waiter.id);
        self
    }

    /// Abort the wait when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn add_job(&mut self, id: JobId) {
        if !self.jobs.contains(&id) {
            self.jobs.push(id);
        }
    }

    pub fn jobs(&self) -> &[JobId] {
        &self.jobs
    }

    /// Wait until all jobs are terminal.
    ///
    /// A zero `timeout` waits indefinitely, as does one too large to add to
    /// the current instant. Errors:
    /// - [`DispatchError::Canceled`] if one of the jobs was canceled
    /// - [`DispatchError::Timeout`] if the deadline passed first
    /// - [`DispatchError::WaitAborted`] if the cancellation token fired
    /// - [`DispatchError::WaitFailed`] wrapping any other polling error
    pub async fn wait_for_jobs(self, timeout: Duration) -> Result<BarrierResult> {
        if self.jobs.is_empty() {
            return Ok(BarrierResult::default());
        }

        let token = self.cancellation.child_token();
        // stops the poller if this future is dropped mid-wait
        let _guard = token.clone().drop_guard();

        // a deadline too far out to represent means no deadline
        let deadline = if timeout.is_zero() {
            None
        } else {
            Instant::now().checked_add(timeout)
        };
        let poller = Poller {
            registry: Arc::clone(&self.registry),
            pending: self.jobs.clone(),
            interval: self.polling_interval.max(MIN_POLLING_INTERVAL),
            deadline,
            timeout,
            token,
            result: BarrierResult::default(),
        };
        tracing::debug!(jobs = self.jobs.len(), timeout_ms = timeout.as_millis() as u64, "Waiting for jobs");

        // the waiter is parked and resumed by the poller task, which outlives
        // this future if it is dropped
        let registry = Arc::clone(&self.registry);
        let waiter = self.waiter;
        let task = tokio::spawn(async move {
            if let Some(waiter) = waiter {
                park_waiter(registry.as_ref(), waiter).await;
            }
            let outcome = poller.run().await;
            if let Some(waiter) = waiter {
                resume_waiter(registry.as_ref(), waiter).await;
            }
            outcome
        });

        let outcome = match task.await {
            Ok(outcome) => outcome,
            Err(e) => Err(DispatchError::Internal(format!("job poller failed: {e}"))),
        };

        match outcome {
            Ok(result) => Ok(result),
            Err(e @ (DispatchError::Canceled(_) | DispatchError::Timeout(_) | DispatchError::WaitAborted)) => {
                Err(e)
            }
            Err(e) => Err(DispatchError::WaitFailed(Box::new(e))),
        }
    }
}

struct Poller {
    registry: Arc<dyn Registry>,
    pending: Vec<JobId>,
    interval: Duration,
    deadline: Option<Instant>,
    timeout: Duration,
    token: CancellationToken,
    result: BarrierResult,
}

impl Poller {
    async fn run(mut self) -> Result<BarrierResult> {
        loop {
            let nap = match self.deadline {
                Some(deadline) => self
                    .interval
                    .min(deadline.saturating_duration_since(Instant::now())),
                None => self.interval,
            };

            tokio::select! {
                _ = self.token.cancelled() => return Err(DispatchError::WaitAborted),
                _ = tokio::time::sleep(nap) => {}
            }

            self.poll().await?;

            if self.pending.is_empty() {
                return Ok(self.result);
            }
            if self.deadline.is_some_and(|d| Instant::now() >= d) {
                tracing::debug!(pending = self.pending.len(), "Deadline passed while waiting for jobs");
                return Err(DispatchError::Timeout(self.timeout));
            }
        }
    }

    async fn poll(&mut self) -> Result<()> {
        let mut still_pending = Vec::with_capacity(self.pending.len());

        for id in std::mem::take(&mut self.pending) {
            match self.registry.get_job(id).await {
                Ok(job) => match job.status() {
                    JobStatus::Canceled => {
                        tracing::info!(job_id = %id, "Job canceled, aborting wait");
                        return Err(DispatchError::Canceled(id));
                    }
                    status @ (JobStatus::Finished | JobStatus::Failed) => {
                        tracing::debug!(job_id = %id, status = %status, "Job terminated");
                        self.result.record(id, status, job.payload);
                    }
                    JobStatus::Deleted => self.vanished(id),
                    _ => still_pending.push(id),
                },
                Err(DispatchError::JobNotFound(_)) => self.vanished(id),
                Err(e) => return Err(e),
            }
        }

        self.pending = still_pending;
        Ok(())
    }

    fn vanished(&mut self, id: JobId) {
        tracing::warn!(job_id = %id, "Job was deleted while waiting for it");
        self.result.record(id, JobStatus::Deleted, None);
        self.result.failures.push(DispatchError::JobNotFound(id));
    }
}

async fn park_waiter(registry: &dyn Registry, id: JobId) {
    let result: Result<()> = async {
        let mut job = registry.get_job(id).await?;
        job.set_status(JobStatus::Waiting)?;
        registry.update_job(&job).await?;
        Ok(())
    }
    .await;

    if let Err(e) = result {
        tracing::warn!(job_id = %id, error = %e, "Unable to mark waiting job as waiting");
    }
}

async fn resume_waiter(registry: &dyn Registry, id: JobId) {
    let result: Result<()> = async {
        let mut job = registry.get_job(id).await?;
        if job.status() != JobStatus::Waiting {
            tracing::debug!(job_id = %id, status = %job.status(), "Waiting job changed status, not resuming it");
            return Ok(());
        }
        job.set_status(JobStatus::Running)?;
        registry.update_job(&job).await?;
        Ok(())
    }
    .await;

    if let Err(e) = result {
        tracing::warn!(job_id = %id, error = %e, "Unable to mark waiting job as running again");
    }
}
