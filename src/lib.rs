pub mod barrier;
pub mod config;
pub mod context;
pub mod error;
pub mod identity;
pub mod producer;
pub mod registry;
pub mod scheduler;
pub mod shutdown;
pub mod worker;

pub use barrier::{BarrierResult, JobBarrier};
pub use error::{DispatchError, Result};
pub use producer::{JobDispatcher, JobProcessor, JobProducer};
pub use registry::{InMemoryRegistry, Registry};
pub use scheduler::{Job, JobId, JobStatus};
