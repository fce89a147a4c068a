use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DispatchError, Result};

pub type JobId = Uuid;

/// Load assumed for a job that does not declare one, roughly one core.
pub const DEFAULT_JOB_LOAD: f32 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Instantiated,
    Queued,
    Dispatching,
    Running,
    Paused,
    Waiting,
    Restart,
    Finished,
    Failed,
    Canceled,
    Deleted,
}

impl JobStatus {
    pub const ALL: [JobStatus; 11] = [
        JobStatus::Instantiated,
        JobStatus::Queued,
        JobStatus::Dispatching,
        JobStatus::Running,
        JobStatus::Paused,
        JobStatus::Waiting,
        JobStatus::Restart,
        JobStatus::Finished,
        JobStatus::Failed,
        JobStatus::Canceled,
        JobStatus::Deleted,
    ];

    pub fn is_terminated(self) -> bool {
        matches!(
            self,
            JobStatus::Finished | JobStatus::Failed | JobStatus::Canceled | JobStatus::Deleted
        )
    }

    pub fn is_active(self) -> bool {
        !self.is_terminated()
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    ///
    /// Re-persisting the same status is always legal. Every active status may
    /// fail or be canceled/deleted from outside; a terminal status may only be
    /// deleted.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;

        if self == next {
            return true;
        }
        if self.is_terminated() {
            return next == Deleted && self != Deleted;
        }
        if matches!(next, Failed | Canceled | Deleted) {
            return true;
        }
        matches!(
            (self, next),
            (Instantiated, Queued | Dispatching | Running | Finished)
                | (Queued, Dispatching | Running)
                | (Dispatching, Running | Queued)
                | (Running, Finished | Paused | Waiting | Restart)
                | (Paused, Running | Queued)
                | (Waiting, Running | Finished)
                | (Restart, Queued | Dispatching | Running)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Instantiated => write!(f, "instantiated"),
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Dispatching => write!(f, "dispatching"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Paused => write!(f, "paused"),
            JobStatus::Waiting => write!(f, "waiting"),
            JobStatus::Restart => write!(f, "restart"),
            JobStatus::Finished => write!(f, "finished"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Canceled => write!(f, "canceled"),
            JobStatus::Deleted => write!(f, "deleted"),
        }
    }
}

/// Why a job ended up failed. Only ever set together with a status change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    #[default]
    None,
    Data,
    Processing,
}

/// One unit of asynchronous, trackable work.
///
/// Lifecycle fields (status, version, dates and the derived queue/run times)
/// are private: status only moves through [`Job::set_status`], and the rest is
/// stamped by the registry when it persists the job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    version: u64,
    pub job_type: String,
    pub operation: String,
    pub arguments: Vec<String>,
    pub creator: Option<String>,
    pub organization: Option<String>,
    pub created_host: Option<String>,
    pub processing_host: Option<String>,
    status: JobStatus,
    failure_reason: FailureReason,
    date_created: DateTime<Utc>,
    date_started: Option<DateTime<Utc>>,
    date_completed: Option<DateTime<Utc>>,
    queue_time: Option<i64>,
    run_time: Option<i64>,
    pub parent_job_id: Option<JobId>,
    pub root_job_id: Option<JobId>,
    pub payload: Option<String>,
    pub dispatchable: bool,
    job_load: f32,
}

impl Job {
    pub fn new(job_type: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), job_type, operation, Utc::now())
    }

    pub fn with_id(
        id: JobId,
        job_type: impl Into<String>,
        operation: impl Into<String>,
        date_created: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            version: 0,
            job_type: job_type.into(),
            operation: operation.into(),
            arguments: Vec::new(),
            creator: None,
            organization: None,
            created_host: None,
            processing_host: None,
            status: JobStatus::Instantiated,
            failure_reason: FailureReason::None,
            date_created,
            date_started: None,
            date_completed: None,
            queue_time: None,
            run_time: None,
            parent_job_id: None,
            root_job_id: None,
            payload: None,
            dispatchable: true,
            job_load: DEFAULT_JOB_LOAD,
        }
    }

    pub fn with_arguments<I, S>(mut self, arguments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments = arguments.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_load(mut self, load: f32) -> Self {
        self.set_job_load(load);
        self
    }

    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn with_creator(mut self, creator: impl Into<String>, organization: impl Into<String>) -> Self {
        self.creator = Some(creator.into());
        self.organization = Some(organization.into());
        self
    }

    /// Attach this job below `parent`; the root is inherited from the parent.
    pub fn with_parent(mut self, parent: &Job) -> Self {
        self.parent_job_id = Some(parent.id);
        self.root_job_id = Some(parent.root_job_id.unwrap_or(parent.id));
        self
    }

    pub fn with_dispatchable(mut self, dispatchable: bool) -> Self {
        self.dispatchable = dispatchable;
        self
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn failure_reason(&self) -> FailureReason {
        self.failure_reason
    }

    pub fn date_created(&self) -> DateTime<Utc> {
        self.date_created
    }

    pub fn date_started(&self) -> Option<DateTime<Utc>> {
        self.date_started
    }

    pub fn date_completed(&self) -> Option<DateTime<Utc>> {
        self.date_completed
    }

    /// Milliseconds spent queued, known once the job started.
    pub fn queue_time(&self) -> Option<i64> {
        self.queue_time
    }

    /// Milliseconds spent running, known once the job completed.
    pub fn run_time(&self) -> Option<i64> {
        self.run_time
    }

    pub fn job_load(&self) -> f32 {
        self.job_load
    }

    /// Negative and NaN loads are stored as zero.
    pub fn set_job_load(&mut self, load: f32) {
        self.job_load = if load.is_nan() { 0.0 } else { load.max(0.0) };
    }

    pub fn is_root(&self) -> bool {
        self.root_job_id.is_none()
    }

    pub fn set_status(&mut self, status: JobStatus) -> Result<()> {
        self.set_status_with_reason(status, FailureReason::None)
    }

    pub fn set_status_with_reason(&mut self, status: JobStatus, reason: FailureReason) -> Result<()> {
        if !self.status.can_transition_to(status) {
            return Err(DispatchError::InvalidTransition {
                id: self.id,
                from: self.status,
                to: status,
            });
        }
        self.status = status;
        self.failure_reason = reason;
        Ok(())
    }

    /// Stamp the bookkeeping a registry applies when it persists this job on
    /// top of `stored_version`: the version is bumped and start/completion
    /// dates plus the derived queue and run times are filled in. A running
    /// job is placed on `host`; a queued or restarting one on no host.
    pub fn stamp_persisted(&mut self, stored_version: u64, now: DateTime<Utc>, host: &str) {
        self.version = stored_version + 1;
        match self.status {
            JobStatus::Running => {
                if self.date_started.is_none() {
                    self.date_started = Some(now);
                    self.queue_time = Some((now - self.date_created).num_milliseconds());
                }
                self.processing_host = Some(host.to_string());
            }
            // back in the queue, not placed on any host until it runs again
            JobStatus::Queued | JobStatus::Restart => {
                self.processing_host = None;
            }
            JobStatus::Failed => {
                // a failed job may never have started
                self.date_completed = Some(now);
                if let Some(started) = self.date_started {
                    self.run_time = Some((now - started).num_milliseconds());
                }
            }
            JobStatus::Finished => {
                // producers managing their own lifecycle may skip RUNNING
                let started = *self.date_started.get_or_insert(self.date_created);
                self.date_completed = Some(now);
                self.run_time = Some((now - started).num_milliseconds());
            }
            _ => {}
        }
    }
}

impl std::fmt::Display for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Job {{id:{}, version:{}}}", self.id, self.version)
    }
}
