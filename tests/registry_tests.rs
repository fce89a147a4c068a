
use job_dispatch::registry::Registry;
use job_dispatch::scheduler::{Job, JobStatus};
use job_dispatch::DispatchError;
use test_harness::{Behavior, TestNode, JOB_TYPE};

#[tokio::test]
async fn test_versions_increase_with_every_update() {
    let node = TestNode::new(4.0, Behavior::Succeed(None));
    let mut job = node.create_job(1.0).await;
    assert_eq!(job.version(), 0);

    for (expected, status) in [
        (1, JobStatus::Dispatching),
        (2, JobStatus::Running),
        (3, JobStatus::Waiting),
        (4, JobStatus::Running),
        (5, JobStatus::Finished),
    ] {
        job.set_status(status).unwrap();
        job = node.registry.update_job(&job).await.unwrap();
        assert_eq!(job.version(), expected);
        assert_eq!(node.registry.get_job(job.id).await.unwrap().version(), expected);
    }
}

#[tokio::test]
async fn test_stale_update_is_rejected_and_store_unchanged() {
    let node = TestNode::new(4.0, Behavior::Succeed(None));
    let job = node.create_job(1.0).await;

    let mut first = job.clone();
    first.set_status(JobStatus::Running).unwrap();
    let stored = node.registry.update_job(&first).await.unwrap();

    let mut stale = job.clone();
    stale.payload = Some("lost".into());
    stale.set_status(JobStatus::Canceled).unwrap();
    let err = node.registry.update_job(&stale).await.unwrap_err();

    assert!(err.is_registry_error());
    assert!(matches!(
        err,
        DispatchError::VersionConflict { presented: 0, stored: 1, .. }
    ));
    let current = node.registry.get_job(job.id).await.unwrap();
    assert_eq!(current.version(), stored.version());
    assert_eq!(current.status(), JobStatus::Running);
    assert!(current.payload.is_none());
}

#[tokio::test]
async fn test_update_of_unknown_job_fails() {
    let node = TestNode::new(4.0, Behavior::Succeed(None));
    let job = Job::new(JOB_TYPE, "encode");

    let err = node.registry.update_job(&job).await.unwrap_err();
    assert!(matches!(err, DispatchError::JobNotFound(id) if id == job.id));
}

#[tokio::test]
async fn test_status_dates_are_kept_by_registry() {
    let node = TestNode::new(4.0, Behavior::Succeed(None));
    let job = node.create_running_job(1.0).await;
    assert!(job.date_started().is_some());
    assert!(job.queue_time().is_some());
    assert!(job.date_completed().is_none());

    let finished = node.terminate(job.id, JobStatus::Finished, None).await;
    assert_eq!(finished.date_started(), job.date_started());
    assert!(finished.date_completed().is_some());
    assert!(finished.run_time().unwrap() >= 0);
}

#[tokio::test]
async fn test_child_jobs_follow_parent_links() {
    let node = TestNode::new(4.0, Behavior::Succeed(None));
    let root = node.create_job(0.0).await;
    let child = node
        .registry
        .create_job(Job::new(JOB_TYPE, "encode").with_parent(&root))
        .await
        .unwrap();
    let grandchild = node
        .registry
        .create_job(Job::new(JOB_TYPE, "encode").with_parent(&child))
        .await
        .unwrap();

    assert_eq!(grandchild.root_job_id, Some(root.id));
    let descendants: Vec<_> = node
        .registry
        .child_jobs(root.id)
        .await
        .into_iter()
        .map(|j| j.id)
        .collect();
    assert_eq!(descendants, vec![child.id, grandchild.id]);
}

#[tokio::test]
async fn test_remove_jobs_is_all_or_nothing() {
    let node = TestNode::new(4.0, Behavior::Succeed(None));
    let kept = node.create_job(1.0).await;
    let unknown = Job::new(JOB_TYPE, "encode");

    let err = node
        .registry
        .remove_jobs(&[kept.id, unknown.id])
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::JobNotFound(_)));
    assert!(node.registry.get_job(kept.id).await.is_ok());
    assert_eq!(node.registry.len().await, 1);
}
