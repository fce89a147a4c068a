//! Background execution of accepted jobs.
//!
//! A dispatcher hands every accepted job to [`executor::run_job`], which runs
//! on its own task and owns the rest of the job's lifecycle:
//!
//! 1. Re-reads the job from the registry
//! 2. Establishes the initiating job and the creator's identity as context
//! 3. Invokes the producer's processing function
//! 4. Persists `Finished` with the payload, or `Failed` plus an incident
//!
//! The context is gone once the task ends, on every exit path.

pub mod executor;

pub use executor::{run_job, ExecutionResult, WorkerContext};
