use std::time::Duration;

use crate::error::{DispatchError, Result};

/// Environment variable controlling whether a node takes jobs heavier than its limit.
pub const ACCEPT_EXCEEDING_ENV: &str = "JOB_DISPATCH_ACCEPT_EXCEEDING_MAX_LOAD";

/// Environment variable sizing the dispatcher worker pool.
pub const MAX_CONCURRENT_JOBS_ENV: &str = "JOB_DISPATCH_MAX_CONCURRENT_JOBS";

pub const DEFAULT_MAX_CONCURRENT_JOBS: usize = 64;
pub const DEFAULT_POLLING_INTERVAL_MS: u64 = 5000;
const DEFAULT_MAX_JOBS: usize = 10_000;

/// Configuration for a job dispatcher.
///
/// Read once when the dispatcher is built and never changed afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Accept jobs whose load alone exceeds this node's maximum load.
    pub accept_exceeding_max_load: bool,
    /// Upper bound on jobs processed concurrently by one dispatcher.
    pub max_concurrent_jobs: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            accept_exceeding_max_load: true,
            max_concurrent_jobs: DEFAULT_MAX_CONCURRENT_JOBS,
        }
    }
}

impl DispatcherConfig {
    pub fn with_accept_exceeding_max_load(mut self, accept: bool) -> Self {
        self.accept_exceeding_max_load = accept;
        self
    }

    pub fn with_max_concurrent_jobs(mut self, max: usize) -> Self {
        self.max_concurrent_jobs = max.max(1);
        self
    }

    /// Build the configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup. Missing keys keep
    /// their defaults; malformed values are an error.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = lookup(ACCEPT_EXCEEDING_ENV) {
            config.accept_exceeding_max_load = parse_bool(ACCEPT_EXCEEDING_ENV, &raw)?;
        }

        if let Some(raw) = lookup(MAX_CONCURRENT_JOBS_ENV) {
            let max = raw.trim().parse::<usize>().map_err(|e| {
                DispatchError::Config(format!("{MAX_CONCURRENT_JOBS_ENV}={raw:?}: {e}"))
            })?;
            if max == 0 {
                return Err(DispatchError::Config(format!(
                    "{MAX_CONCURRENT_JOBS_ENV} must be at least 1"
                )));
            }
            config.max_concurrent_jobs = max;
        }

        Ok(config)
    }
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(DispatchError::Config(format!(
            "{key}={raw:?} is not a boolean"
        ))),
    }
}

/// Configuration for job barriers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BarrierConfig {
    /// How often the registry is asked for the status of pending jobs.
    pub polling_interval: Duration,
}

impl Default for BarrierConfig {
    fn default() -> Self {
        Self {
            polling_interval: Duration::from_millis(DEFAULT_POLLING_INTERVAL_MS),
        }
    }
}

impl BarrierConfig {
    pub fn with_polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = interval;
        self
    }
}

/// Configuration for the in-memory registry.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryConfig {
    /// Name this node registers under.
    pub hostname: String,
    /// Maximum load this node is willing to carry.
    pub max_load: f32,
    /// Maximum number of jobs kept in the registry.
    pub max_jobs: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            hostname: "localhost".to_string(),
            max_load: cores as f32,
            max_jobs: DEFAULT_MAX_JOBS,
        }
    }
}

impl RegistryConfig {
    pub fn new(hostname: impl Into<String>, max_load: f32) -> Self {
        Self {
            hostname: hostname.into(),
            max_load,
            ..Default::default()
        }
    }

    pub fn with_max_jobs(mut self, max_jobs: usize) -> Self {
        self.max_jobs = max_jobs;
        self
    }
}
