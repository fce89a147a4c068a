//! Task scoped execution context.
//!
//! Worker tasks share one runtime, so the job being processed and the identity
//! it runs under are carried in a tokio task-local instead of global state.
//! A context only exists inside [`scope`] and disappears when the scoped future
//! completes, fails or unwinds.

use std::future::Future;

use crate::identity::Identity;
use crate::scheduler::Job;

tokio::task_local! {
    static EXECUTION: ExecutionContext;
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    /// The job on whose behalf the current task runs, used as parent for
    /// jobs created from within it.
    pub current_job: Option<Job>,
    /// Organization and user the current task acts as.
    pub identity: Option<Identity>,
}

impl ExecutionContext {
    pub fn for_job(job: Job) -> Self {
        Self {
            current_job: Some(job),
            identity: None,
        }
    }

    pub fn with_job(mut self, job: Job) -> Self {
        self.current_job = Some(job);
        self
    }

    pub fn with_identity(mut self, identity: Option<Identity>) -> Self {
        self.identity = identity;
        self
    }
}

/// Run `fut` with `ctx` as its execution context.
pub async fn scope<F>(ctx: ExecutionContext, fut: F) -> F::Output
where
    F: Future,
{
    EXECUTION.scope(ctx, fut).await
}

/// A copy of the current context, empty outside of [`scope`].
pub fn current() -> ExecutionContext {
    EXECUTION.try_with(ExecutionContext::clone).unwrap_or_default()
}

pub fn current_job() -> Option<Job> {
    EXECUTION
        .try_with(|ctx| ctx.current_job.clone())
        .ok()
        .flatten()
}

pub fn current_identity() -> Option<Identity> {
    EXECUTION
        .try_with(|ctx| ctx.identity.clone())
        .ok()
        .flatten()
}
