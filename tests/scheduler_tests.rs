
use std::time::Duration;

use job_dispatch::config::DispatcherConfig;
use job_dispatch::producer::JobProducer;
use job_dispatch::registry::Registry;
use job_dispatch::scheduler::{FailureReason, Job, JobStatus};
use job_dispatch::DispatchError;
use test_harness::{Behavior, TestNode, JOB_TYPE};

fn idle() -> Behavior {
    Behavior::Succeed(None)
}

#[tokio::test]
async fn test_accepts_job_that_fits_remaining_load() {
    let node = TestNode::new(4.0, idle());
    node.create_running_job(1.0).await;
    let job = node.create_job(2.0).await;

    assert!(node.dispatcher.is_ready_to_accept(&job).await.unwrap());
}

#[tokio::test]
async fn test_declines_job_that_would_overload_node() {
    let node = TestNode::new(4.0, idle());
    node.create_running_job(3.5).await;
    let job = node.create_job(1.0).await;

    assert!(!node.dispatcher.is_ready_to_accept(&job).await.unwrap());
    assert_eq!(node.dispatcher.stats().rejected, 1);
}

#[tokio::test]
async fn test_job_filling_node_exactly_is_accepted() {
    let node = TestNode::new(4.0, idle());
    node.create_running_job(3.0).await;
    let job = node.create_job(1.0).await;

    assert!(node.dispatcher.is_ready_to_accept(&job).await.unwrap());
}

#[tokio::test]
async fn test_oversized_job_accepted_on_idle_node_when_allowed() {
    let node = TestNode::new(4.0, idle());
    let job = node.create_job(5.0).await;

    assert!(node.dispatcher.is_ready_to_accept(&job).await.unwrap());
}

#[tokio::test]
async fn test_oversized_job_rejected_when_not_allowed() {
    let config = DispatcherConfig::default().with_accept_exceeding_max_load(false);
    let node = TestNode::with_config(4.0, idle(), config);
    let job = node.create_job(5.0).await;

    assert!(!node.dispatcher.is_ready_to_accept(&job).await.unwrap());
}

#[tokio::test]
async fn test_oversized_job_accepted_regardless_of_current_load() {
    let node = TestNode::new(4.0, idle());
    node.create_running_job(3.0).await;
    let job = node.create_job(5.0).await;

    assert!(node.dispatcher.is_ready_to_accept(&job).await.unwrap());
    assert_eq!(node.dispatcher.stats().rejected, 0);
}

#[tokio::test]
async fn test_other_job_type_is_declined() {
    let node = TestNode::new(4.0, idle());
    let job = node
        .registry
        .create_job(Job::new("org.example.other", "encode"))
        .await
        .unwrap();

    assert!(!node.dispatcher.is_ready_to_accept(&job).await.unwrap());
}

#[tokio::test]
async fn test_undispatchable_propagates_from_admission() {
    let node = TestNode::new(4.0, idle());
    node.processor.refuse_all();
    let job = node.create_job(1.0).await;

    let err = node.dispatcher.is_ready_to_accept(&job).await.unwrap_err();
    assert!(matches!(err, DispatchError::Undispatchable(_)));
}

#[tokio::test]
async fn test_dispatch_fails_undispatchable_job_for_good() {
    let node = TestNode::new(4.0, idle());
    node.processor.refuse_all();
    let job = node.create_job(1.0).await;

    let err = node.local.dispatch(&job).await.unwrap_err();
    assert!(matches!(err, DispatchError::Undispatchable(_)));

    let stored = node.registry.get_job(job.id).await.unwrap();
    assert_eq!(stored.status(), JobStatus::Failed);
    assert_eq!(stored.failure_reason(), FailureReason::Data);
}

#[tokio::test]
async fn test_dispatch_requeues_job_nobody_accepts() {
    let node = TestNode::new(2.0, idle());
    node.create_running_job(2.0).await;
    let job = node.create_job(1.0).await;

    assert!(!node.local.dispatch(&job).await.unwrap());
    assert_eq!(node.status_of(job.id).await, JobStatus::Queued);

    // a second attempt is possible once the requeued job is read again
    assert!(!node.local.dispatch(&job).await.unwrap());
}

#[tokio::test]
async fn test_dispatch_requeues_job_of_unknown_type() {
    let node = TestNode::new(4.0, idle());
    let job = node
        .registry
        .create_job(Job::new("org.example.other", "encode"))
        .await
        .unwrap();

    assert!(!node.local.dispatch(&job).await.unwrap());
    assert_eq!(node.status_of(job.id).await, JobStatus::Queued);
}

#[tokio::test]
async fn test_dispatched_job_runs_to_completion() {
    let node = TestNode::new(4.0, Behavior::Succeed(Some("track.mp4".into())));
    let job = node.submit(1.0).await;

    assert!(
        node.wait_for_status(job.id, JobStatus::Finished, Duration::from_secs(2))
            .await
    );
    let stored = node.registry.get_job(job.id).await.unwrap();
    assert_eq!(stored.payload.as_deref(), Some("track.mp4"));
    assert_eq!(stored.processing_host.as_deref(), Some(test_harness::HOST));
    assert!(stored.date_started().is_some());
    assert!(stored.date_completed().is_some());
}

#[tokio::test]
async fn test_running_jobs_count_against_load() {
    let node = TestNode::new(2.0, Behavior::Gated);
    node.submit(1.0).await;
    node.submit(1.0).await;

    assert_eq!(node.registry.own_load().await.unwrap(), 2.0);
    let third = node.create_job(1.0).await;
    assert!(!node.local.dispatch(&third).await.unwrap());

    node.processor.open_gate(2);
    assert!(
        test_harness::wait_for(
            || async { node.registry.own_load().await.unwrap() == 0.0 },
            Duration::from_secs(2),
            Duration::from_millis(5),
        )
        .await
    );
    assert!(node.local.dispatch(&third).await.unwrap());
    node.processor.open_gate(1);
}

#[tokio::test]
async fn test_count_jobs_requires_status() {
    let node = TestNode::new(4.0, idle());
    node.create_job(1.0).await;
    node.create_job(1.0).await;

    let err = node.dispatcher.count_jobs(None).await.unwrap_err();
    assert!(matches!(err, DispatchError::MissingStatus));
    assert!(err.is_registry_error());

    assert_eq!(node.dispatcher.count_jobs(Some(JobStatus::Queued)).await.unwrap(), 2);
    assert_eq!(node.dispatcher.job_type(), JOB_TYPE);
}

#[tokio::test]
async fn test_restarted_job_is_not_counted_against_its_old_host() {
    let node = TestNode::new(2.0, idle());
    let mut job = node.create_running_job(1.5).await;
    assert_eq!(node.registry.own_load().await.unwrap(), 1.5);

    job.set_status(JobStatus::Restart).unwrap();
    let mut job = node.registry.update_job(&job).await.unwrap();
    job.set_status(JobStatus::Queued).unwrap();
    let job = node.registry.update_job(&job).await.unwrap();

    assert!(job.processing_host.is_none());
    assert_eq!(node.registry.own_load().await.unwrap(), 0.0);
    assert!(node.dispatcher.is_ready_to_accept(&job).await.unwrap());
}

#[tokio::test]
async fn test_running_job_counts_on_the_node_running_it() {
    let node = TestNode::new(4.0, idle());
    let job = node
        .registry
        .create_job({
            let mut job = Job::new(JOB_TYPE, "encode").with_load(2.0);
            job.processing_host = Some("node-b".into());
            job
        })
        .await
        .unwrap();

    let mut running = job.clone();
    running.set_status(JobStatus::Running).unwrap();
    let running = node.registry.update_job(&running).await.unwrap();

    assert_eq!(running.processing_host.as_deref(), Some(test_harness::HOST));
    assert_eq!(node.registry.own_load().await.unwrap(), 2.0);
}
