//! Load based admission control.
//!
//! A node accepts a job when the job's load fits next to the load the node
//! has already committed to. The committed load never includes the candidate
//! itself, so the candidate is added exactly once here.

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The projected load stays within the node's limit.
    Accept,
    /// The job alone is heavier than the node's limit but the node is
    /// configured to take such jobs anyway.
    AcceptExceeding,
    /// Accepting the job would push the node over its limit.
    Reject,
}

impl Admission {
    pub fn is_accepted(self) -> bool {
        !matches!(self, Admission::Reject)
    }
}

/// Decide whether a job of `job_load` fits on a node with `max_load`
/// that is currently running `current_load`.
///
/// Oversized jobs are checked first: some job types only ever run on the
/// most capable node, and rejecting them there would starve them forever.
pub fn decide(job_load: f32, max_load: f32, current_load: f32, accept_exceeding: bool) -> Admission {
    if job_load > max_load && accept_exceeding {
        return Admission::AcceptExceeding;
    }
    if current_load + job_load > max_load {
        return Admission::Reject;
    }
    Admission::Accept
}
