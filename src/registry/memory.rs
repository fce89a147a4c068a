use std::collections::{HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, RwLock};

use crate::config::RegistryConfig;
use crate::context;
use crate::error::{DispatchError, Result};
use crate::registry::{Incident, Incidents, NodeLoad, Registry, Severity};
use crate::scheduler::{Job, JobId, JobStatus};

/// Statuses whose load counts against the node processing the job.
const LOAD_BEARING_STATUSES: [JobStatus; 2] = [JobStatus::Queued, JobStatus::Running];

#[derive(Debug, Default)]
struct RegistryState {
    jobs: HashMap<JobId, Job>,
    /// Maximum load per registered host.
    hosts: HashMap<String, f32>,
}

impl RegistryState {
    fn load_on(&self, host: &str) -> f32 {
        self.jobs
            .values()
            .filter(|j| j.processing_host.as_deref() == Some(host))
            .filter(|j| LOAD_BEARING_STATUSES.contains(&j.status()))
            .map(Job::job_load)
            .sum()
    }
}

/// Single-node registry keeping every job in memory.
#[derive(Debug)]
pub struct InMemoryRegistry {
    config: RegistryConfig,
    state: RwLock<RegistryState>,
    incidents: InMemoryIncidents,
}

impl InMemoryRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        let mut state = RegistryState::default();
        state
            .hosts
            .insert(config.hostname.clone(), config.max_load);
        Self {
            config,
            state: RwLock::new(state),
            incidents: InMemoryIncidents::default(),
        }
    }

    /// Register another host and the maximum load it accepts.
    pub async fn register_host(&self, host: impl Into<String>, max_load: f32) {
        let host = host.into();
        tracing::info!(host = %host, max_load, "Host registered");
        self.state.write().await.hosts.insert(host, max_load);
    }

    /// Store a new job built by the caller.
    ///
    /// Dispatchable jobs start out queued, the others instantiated. Creator
    /// and parent default to the calling task's execution context.
    pub async fn create_job(&self, mut job: Job) -> Result<Job> {
        let ctx = context::current();
        if job.creator.is_none() {
            if let Some(identity) = ctx.identity {
                job.organization = Some(identity.organization.id.clone());
                job.creator = identity.user.map(|u| u.username);
            }
        }
        if job.parent_job_id.is_none() {
            if let Some(parent) = ctx.current_job {
                job = job.with_parent(&parent);
            }
        }
        if job.created_host.is_none() {
            job.created_host = Some(self.config.hostname.clone());
        }
        if job.dispatchable && job.status() == JobStatus::Instantiated {
            job.set_status(JobStatus::Queued)?;
        }

        let mut state = self.state.write().await;
        if state.jobs.len() >= self.config.max_jobs {
            return Err(DispatchError::Registry(format!(
                "registry is at capacity ({} jobs)",
                self.config.max_jobs
            )));
        }
        if state.jobs.contains_key(&job.id) {
            return Err(DispatchError::Registry(format!("job {} already exists", job.id)));
        }
        state.jobs.insert(job.id, job.clone());
        tracing::debug!(job_id = %job.id, job_type = %job.job_type, operation = %job.operation, "Job created");
        Ok(job)
    }

    /// Remove jobs by id. Nothing is removed unless every id exists.
    pub async fn remove_jobs(&self, ids: &[JobId]) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(missing) = ids.iter().find(|id| !state.jobs.contains_key(id)) {
            return Err(DispatchError::JobNotFound(*missing));
        }
        for id in ids {
            state.jobs.remove(id);
        }
        Ok(())
    }

    /// Mark a job canceled from outside of its processing.
    pub async fn cancel_job(&self, id: JobId) -> Result<Job> {
        let mut job = self.get_job(id).await?;
        job.set_status(JobStatus::Canceled)?;
        let job = self.update_job(&job).await?;
        tracing::info!(job_id = %id, "Job canceled");
        Ok(job)
    }

    /// All descendants of a job, oldest first.
    pub async fn child_jobs(&self, id: JobId) -> Vec<Job> {
        let state = self.state.read().await;
        let mut children: HashMap<JobId, Vec<&Job>> = HashMap::new();
        for job in state.jobs.values() {
            if let Some(parent) = job.parent_job_id {
                children.entry(parent).or_default().push(job);
            }
        }

        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([id]);
        let mut result = Vec::new();
        while let Some(parent) = queue.pop_front() {
            for child in children.get(&parent).into_iter().flatten() {
                if seen.insert(child.id) {
                    queue.push_back(child.id);
                    result.push((*child).clone());
                }
            }
        }
        result.sort_by_key(Job::date_created);
        result
    }

    /// Jobs of a type in a status.
    pub async fn jobs(&self, job_type: &str, status: JobStatus) -> Vec<Job> {
        let state = self.state.read().await;
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| j.job_type == job_type && j.status() == status)
            .cloned()
            .collect();
        jobs.sort_by_key(Job::date_created);
        jobs
    }

    /// Jobs not yet in a terminal status, oldest first.
    pub async fn active_jobs(&self) -> Vec<Job> {
        let state = self.state.read().await;
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| j.status().is_active())
            .cloned()
            .collect();
        jobs.sort_by_key(Job::date_created);
        jobs
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.jobs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.jobs.is_empty()
    }

    pub fn incident_log(&self) -> &InMemoryIncidents {
        &self.incidents
    }
}

impl Default for InMemoryRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

#[async_trait]
impl Registry for InMemoryRegistry {
    async fn get_job(&self, id: JobId) -> Result<Job> {
        self.state
            .read()
            .await
            .jobs
            .get(&id)
            .cloned()
            .ok_or(DispatchError::JobNotFound(id))
    }

    async fn update_job(&self, job: &Job) -> Result<Job> {
        let mut state = self.state.write().await;
        let stored = state
            .jobs
            .get(&job.id)
            .ok_or(DispatchError::JobNotFound(job.id))?;

        if stored.version() != job.version() {
            return Err(DispatchError::VersionConflict {
                id: job.id,
                presented: job.version(),
                stored: stored.version(),
            });
        }
        if !stored.status().can_transition_to(job.status()) {
            return Err(DispatchError::InvalidTransition {
                id: job.id,
                from: stored.status(),
                to: job.status(),
            });
        }

        let mut updated = job.clone();
        updated.stamp_persisted(stored.version(), Utc::now(), &self.config.hostname);
        state.jobs.insert(updated.id, updated.clone());
        tracing::debug!(
            job_id = %updated.id,
            status = %updated.status(),
            version = updated.version(),
            "Job updated"
        );
        Ok(updated)
    }

    async fn count(&self, job_type: &str, status: JobStatus) -> Result<u64> {
        let state = self.state.read().await;
        Ok(state
            .jobs
            .values()
            .filter(|j| j.job_type == job_type && j.status() == status)
            .count() as u64)
    }

    async fn max_load_on_node(&self, host: &str) -> Result<NodeLoad> {
        let state = self.state.read().await;
        let max_load = state.hosts.get(host).copied().ok_or_else(|| {
            DispatchError::Registry(format!("unable to find host {host} in service registry"))
        })?;
        Ok(NodeLoad {
            host: host.to_string(),
            current_load: state.load_on(host),
            max_load,
        })
    }

    async fn own_load(&self) -> Result<f32> {
        Ok(self.state.read().await.load_on(&self.config.hostname))
    }

    fn hostname(&self) -> &str {
        &self.config.hostname
    }

    fn incidents(&self) -> &dyn Incidents {
        &self.incidents
    }
}

/// Incidents kept in memory for inspection.
#[derive(Debug, Default)]
pub struct InMemoryIncidents {
    records: Mutex<Vec<Incident>>,
}

impl InMemoryIncidents {
    pub async fn records(&self) -> Vec<Incident> {
        self.records.lock().await.clone()
    }

    pub async fn for_job(&self, job_id: JobId) -> Vec<Incident> {
        self.records
            .lock()
            .await
            .iter()
            .filter(|i| i.job_id == job_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Incidents for InMemoryIncidents {
    async fn unhandled_exception(
        &self,
        job: &Job,
        severity: Severity,
        error: &DispatchError,
    ) -> Result<()> {
        let incident = Incident::from_error(job, severity, error);
        tracing::debug!(job_id = %job.id, severity = %severity, message = %incident.message, "Incident recorded");
        self.records.lock().await.push(incident);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{self, ExecutionContext};
    use crate::identity::{Identity, Organization, User};

    fn registry() -> InMemoryRegistry {
        InMemoryRegistry::new(RegistryConfig::new("node-a", 4.0))
    }

    #[tokio::test]
    async fn create_job_queues_dispatchable_jobs() {
        let registry = registry();
        let queued = registry.create_job(Job::new("t", "op")).await.unwrap();
        let held = registry
            .create_job(Job::new("t", "op").with_dispatchable(false))
            .await
            .unwrap();

        assert_eq!(queued.status(), JobStatus::Queued);
        assert_eq!(held.status(), JobStatus::Instantiated);
        assert_eq!(queued.created_host.as_deref(), Some("node-a"));
        assert_eq!(queued.version(), 0);
    }

    #[tokio::test]
    async fn create_job_takes_creator_and_parent_from_context() {
        let registry = registry();
        let parent = registry.create_job(Job::new("workflow", "start")).await.unwrap();
        let ctx = ExecutionContext::for_job(parent.clone()).with_identity(Some(Identity {
            organization: Organization::new("org", "Org"),
            user: Some(User::new("alice", "org")),
        }));

        let child = context::scope(ctx, registry.create_job(Job::new("t", "op")))
            .await
            .unwrap();

        assert_eq!(child.parent_job_id, Some(parent.id));
        assert_eq!(child.root_job_id, Some(parent.id));
        assert_eq!(child.creator.as_deref(), Some("alice"));
        assert_eq!(child.organization.as_deref(), Some("org"));
    }

    #[tokio::test]
    async fn create_job_respects_capacity() {
        let registry = InMemoryRegistry::new(RegistryConfig::new("node-a", 4.0).with_max_jobs(1));
        registry.create_job(Job::new("t", "op")).await.unwrap();
        let err = registry.create_job(Job::new("t", "op")).await.unwrap_err();
        assert!(err.is_registry_error());
    }

    #[tokio::test]
    async fn update_rejects_illegal_transition_against_stored_status() {
        let registry = registry();
        let job = registry.create_job(Job::new("t", "op")).await.unwrap();
        let mut running = job.clone();
        running.set_status(JobStatus::Running).unwrap();
        let running = registry.update_job(&running).await.unwrap();

        let mut finished = running.clone();
        finished.set_status(JobStatus::Finished).unwrap();
        registry.update_job(&finished).await.unwrap();

        // a copy that still believes the job is running cannot revive it
        let mut stale = registry.get_job(job.id).await.unwrap();
        assert_eq!(stale.status(), JobStatus::Finished);
        assert!(stale.set_status(JobStatus::Running).is_err());
    }

    #[tokio::test]
    async fn own_load_counts_queued_and_running_jobs_on_this_host() {
        let registry = registry();
        for load in [1.0, 2.0] {
            let mut job = registry
                .create_job(Job::new("t", "op").with_load(load))
                .await
                .unwrap();
            job.set_status(JobStatus::Running).unwrap();
            registry.update_job(&job).await.unwrap();
        }
        // queued but not yet placed on a host
        registry
            .create_job(Job::new("t", "op").with_load(5.0))
            .await
            .unwrap();

        assert_eq!(registry.own_load().await.unwrap(), 3.0);
        let node = registry.max_load_on_node("node-a").await.unwrap();
        assert_eq!(node.max_load, 4.0);
        assert_eq!(node.current_load, 3.0);
    }

    #[tokio::test]
    async fn waiting_jobs_do_not_count_as_load() {
        let registry = registry();
        let mut job = registry
            .create_job(Job::new("t", "op").with_load(2.0))
            .await
            .unwrap();
        job.set_status(JobStatus::Running).unwrap();
        let mut job = registry.update_job(&job).await.unwrap();
        job.set_status(JobStatus::Waiting).unwrap();
        registry.update_job(&job).await.unwrap();

        assert_eq!(registry.own_load().await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn unknown_host_is_a_registry_error() {
        let err = registry().max_load_on_node("nowhere").await.unwrap_err();
        assert!(err.is_registry_error());
    }

    #[tokio::test]
    async fn registered_hosts_report_their_limit() {
        let registry = registry();
        registry.register_host("node-b", 16.0).await;
        assert_eq!(registry.max_load_on_node("node-b").await.unwrap().max_load, 16.0);
    }

    #[tokio::test]
    async fn child_jobs_include_all_descendants() {
        let registry = registry();
        let root = registry.create_job(Job::new("workflow", "start")).await.unwrap();
        let child = registry
            .create_job(Job::new("t", "a").with_parent(&root))
            .await
            .unwrap();
        let grandchild = registry
            .create_job(Job::new("t", "b").with_parent(&child))
            .await
            .unwrap();
        registry.create_job(Job::new("t", "unrelated")).await.unwrap();

        let ids: Vec<_> = registry.child_jobs(root.id).await.iter().map(|j| j.id).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&child.id));
        assert!(ids.contains(&grandchild.id));
        assert_eq!(registry.child_jobs(child.id).await.len(), 1);
    }

    #[tokio::test]
    async fn remove_jobs_is_all_or_nothing() {
        let registry = registry();
        let job = registry.create_job(Job::new("t", "op")).await.unwrap();
        let missing = uuid::Uuid::new_v4();

        let err = registry.remove_jobs(&[job.id, missing]).await.unwrap_err();
        assert!(matches!(err, DispatchError::JobNotFound(id) if id == missing));
        assert_eq!(registry.len().await, 1);

        registry.remove_jobs(&[job.id]).await.unwrap();
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn active_jobs_and_jobs_by_status() {
        let registry = registry();
        let job = registry.create_job(Job::new("t", "op")).await.unwrap();
        registry.create_job(Job::new("t", "op")).await.unwrap();
        registry.cancel_job(job.id).await.unwrap();

        assert_eq!(registry.active_jobs().await.len(), 1);
        assert_eq!(registry.jobs("t", JobStatus::Canceled).await.len(), 1);
        assert_eq!(registry.count("t", JobStatus::Queued).await.unwrap(), 1);
    }
}
