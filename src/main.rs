use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use rand::Rng;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use job_dispatch::barrier::JobBarrier;
use job_dispatch::config::{DispatcherConfig, RegistryConfig};
use job_dispatch::identity::{InMemoryDirectory, Organization, User};
use job_dispatch::producer::{JobDispatcher, JobProcessor, StatsSnapshot};
use job_dispatch::registry::{InMemoryRegistry, Registry};
use job_dispatch::scheduler::{Job, JobId, JobStatus, LocalDispatcher};
use job_dispatch::shutdown::install_shutdown_handler;
use job_dispatch::{DispatchError, Result};

const DEMO_JOB_TYPE: &str = "org.example.demo";
const DEMO_ORG: &str = "demo";
const DEMO_USER: &str = "operator";

#[derive(Parser, Debug)]
#[command(name = "job-dispatch")]
#[command(version)]
#[command(about = "Load-aware job dispatch with multi-job barriers")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Dispatch simulated jobs on a local node and wait for all of them
    Run(RunArgs),
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Number of jobs to submit
    #[arg(long, default_value = "8")]
    jobs: usize,

    /// Maximum load of the local node
    #[arg(long, default_value = "4.0")]
    max_load: f32,

    /// Load declared by every job
    #[arg(long, default_value = "1.0")]
    job_load: f32,

    /// Longest simulated processing time in milliseconds
    #[arg(long, default_value = "500")]
    max_work_ms: u64,

    /// Share of jobs failing during processing (0.0 - 1.0)
    #[arg(long, default_value = "0.0")]
    fail_rate: f64,

    /// Barrier polling interval in milliseconds
    #[arg(long, default_value = "100")]
    poll_ms: u64,

    /// Stop waiting after this many milliseconds, 0 waits until done
    #[arg(long, default_value = "0")]
    timeout_ms: u64,

    /// Never accept jobs heavier than the node's maximum load
    #[arg(long)]
    reject_exceeding: bool,
}

/// Sleeps for a random time, failing some of the jobs.
struct SimulatedWork {
    max_work_ms: u64,
    fail_rate: f64,
}

#[async_trait]
impl JobProcessor for SimulatedWork {
    fn job_type(&self) -> &str {
        DEMO_JOB_TYPE
    }

    async fn process(&self, job: &Job) -> Result<Option<String>> {
        let (work_ms, fail) = {
            let mut rng = rand::thread_rng();
            (
                rng.gen_range(0..=self.max_work_ms),
                rng.gen_bool(self.fail_rate.clamp(0.0, 1.0)),
            )
        };
        tokio::time::sleep(Duration::from_millis(work_ms)).await;

        if fail {
            return Err(DispatchError::Processing(format!(
                "simulated failure after {work_ms}ms"
            )));
        }
        Ok(Some(format!(
            "{} done in {work_ms}ms",
            job.arguments.join(" ")
        )))
    }
}

#[derive(Serialize)]
struct JobSummary {
    id: JobId,
    status: Option<JobStatus>,
    payload: Option<String>,
}

#[derive(Serialize)]
struct RunSummary {
    success: bool,
    error: Option<String>,
    jobs: Vec<JobSummary>,
    stats: StatsSnapshot,
}

async fn run(args: RunArgs) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let shutdown = install_shutdown_handler();

    let mut config = DispatcherConfig::from_env()?;
    if args.reject_exceeding {
        config = config.with_accept_exceeding_max_load(false);
    }

    let registry = Arc::new(InMemoryRegistry::new(RegistryConfig::new(
        "localhost",
        args.max_load,
    )));
    let directory = InMemoryDirectory::new()
        .with_organization(Organization::new(DEMO_ORG, "Demo"))
        .with_user(User::new(DEMO_USER, DEMO_ORG));

    let dispatcher = Arc::new(JobDispatcher::new(
        Arc::new(SimulatedWork {
            max_work_ms: args.max_work_ms,
            fail_rate: args.fail_rate,
        }),
        registry.clone(),
        Arc::new(directory),
        config,
    ));
    let local = LocalDispatcher::new(registry.clone()).with_producer(dispatcher.clone());

    // the job standing for this process while it waits
    let mut waiter = registry
        .create_job(
            Job::new("org.example.workflow", "run")
                .with_creator(DEMO_USER, DEMO_ORG)
                .with_load(0.0)
                .with_dispatchable(false),
        )
        .await?;
    waiter.set_status(JobStatus::Running)?;
    let waiter = registry.update_job(&waiter).await?;

    let poll = Duration::from_millis(args.poll_ms);
    let mut ids = Vec::with_capacity(args.jobs);
    for i in 0..args.jobs {
        let job = registry
            .create_job(
                Job::new(DEMO_JOB_TYPE, "simulate")
                    .with_arguments(["job".to_string(), i.to_string()])
                    .with_load(args.job_load)
                    .with_creator(DEMO_USER, DEMO_ORG)
                    .with_parent(&waiter),
            )
            .await?;
        ids.push(job.id);

        // keep offering the job until the node has room for it
        while !local.dispatch(&job).await? {
            if shutdown.is_cancelled() {
                return Err("interrupted while dispatching".into());
            }
            tokio::time::sleep(poll).await;
        }
    }

    let outcome = JobBarrier::for_jobs(registry.clone(), ids.iter().copied())
        .with_waiter(&waiter)
        .with_polling_interval(poll)
        .with_cancellation(shutdown.clone())
        .wait_for_jobs(Duration::from_millis(args.timeout_ms))
        .await;

    let mut jobs = Vec::with_capacity(ids.len());
    for id in &ids {
        let job = registry.get_job(*id).await.ok();
        jobs.push(JobSummary {
            id: *id,
            status: job.as_ref().map(Job::status),
            payload: job.and_then(|j| j.payload),
        });
    }

    let summary = RunSummary {
        success: outcome.as_ref().map(|r| r.is_success()).unwrap_or(false),
        error: outcome.err().map(|e| e.to_string()),
        jobs,
        stats: dispatcher.stats(),
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);

    dispatcher.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Run(run_args) => run(run_args).await?,
    }

    Ok(())
}
