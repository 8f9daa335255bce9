//! End-to-end tests for project permission jobs: orchestrator writes,
//! leasing from several instances, stall recovery and operator actions.

mod common;

use common::{job_queue, seed_repositories, ts, SharedDb, EXTERNAL_SERVICE_ID, PROJECT_KEY};
use repo_upkeep::permission_jobs::{
    JobQueue, JobState, ListJobsArgs, NewPermissionJob, Permission, StalledReset, UserPermission,
};
use repo_upkeep::repos::{RepositoryDirectory, SqliteRepositoryDirectory};
use repo_upkeep::sync::{SqliteSyncOrchestrator, SyncOrchestrator};
use repo_upkeep::StoreError;
use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;

fn grants() -> Vec<UserPermission> {
    vec![
        UserPermission::new("bob@example.com", Permission::Write),
        UserPermission::new("alice", Permission::Read),
    ]
}

fn new_job(project_key: &str) -> NewPermissionJob {
    NewPermissionJob {
        project_key: project_key.to_string(),
        external_service_id: EXTERNAL_SERVICE_ID,
        permissions: grants(),
        unrestricted: false,
    }
}

#[test]
fn test_project_permissions_are_visible_from_another_instance() {
    let shared = SharedDb::new();
    seed_repositories(&shared.first, 1..=3, "bitbucket.example.com/PROJ");
    SqliteRepositoryDirectory::new(shared.first.clone())
        .soft_delete(3, ts(0))
        .unwrap();

    let orchestrator = SqliteSyncOrchestrator::new(shared.first.clone(), job_queue(&shared.first));
    let job = orchestrator
        .set_bitbucket_project_permissions(PROJECT_KEY, EXTERNAL_SERVICE_ID, grants(), None, ts(10))
        .unwrap();
    assert_eq!(job.state, JobState::Queued);
    assert_eq!(job.project_key, PROJECT_KEY);
    assert!(!job.unrestricted);

    let reader = SqliteSyncOrchestrator::new(shared.second.clone(), job_queue(&shared.second));
    let snapshot = reader.repository_permissions(1).unwrap().unwrap();
    assert_eq!(snapshot.source_job_id, Some(job.id));
    assert_eq!(snapshot.updated_at, ts(10));
    let binds: Vec<&str> = snapshot
        .permissions
        .iter()
        .map(|p| p.bind_id.as_str())
        .collect();
    assert_eq!(binds, vec!["alice", "bob@example.com"]);
    assert!(reader.repository_permissions(2).unwrap().is_some());
    assert!(matches!(
        reader.repository_permissions(3),
        Err(StoreError::UnknownRepository(3))
    ));

    let listed = reader
        .list_bitbucket_project_permission_jobs(&ListJobsArgs {
            project_keys: Some(vec![PROJECT_KEY.to_string()]),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(listed, vec![job]);
}

#[test]
fn test_unrestricted_replaces_previous_grants() {
    let shared = SharedDb::new();
    seed_repositories(&shared.first, 1..=1, "bitbucket.example.com/PROJ");
    let orchestrator = SqliteSyncOrchestrator::new(shared.first.clone(), job_queue(&shared.first));

    orchestrator
        .set_bitbucket_project_permissions(PROJECT_KEY, EXTERNAL_SERVICE_ID, grants(), None, ts(0))
        .unwrap();
    let second = orchestrator
        .set_bitbucket_project_permissions(PROJECT_KEY, EXTERNAL_SERVICE_ID, Vec::new(), Some(true), ts(5))
        .unwrap();

    let snapshot = orchestrator.repository_permissions(1).unwrap().unwrap();
    assert!(snapshot.unrestricted);
    assert!(snapshot.permissions.is_empty());
    assert_eq!(snapshot.source_job_id, Some(second.id));
}

#[test]
fn test_unknown_project_is_rejected() {
    let shared = SharedDb::new();
    seed_repositories(&shared.first, 1..=2, "bitbucket.example.com/PROJ");
    let orchestrator = SqliteSyncOrchestrator::new(shared.first.clone(), job_queue(&shared.first));

    let err = orchestrator
        .set_bitbucket_project_permissions("OTHER", EXTERNAL_SERVICE_ID, grants(), None, ts(0))
        .unwrap_err();
    assert!(matches!(err, StoreError::UnknownProject { .. }));

    // Same key on a different external service is a different project
    let err = orchestrator
        .set_bitbucket_project_permissions(PROJECT_KEY, 99, grants(), None, ts(0))
        .unwrap_err();
    assert!(matches!(err, StoreError::UnknownProject { .. }));

    assert!(job_queue(&shared.first)
        .list(&ListJobsArgs::default())
        .unwrap()
        .is_empty());
}

#[test]
fn test_concurrent_leases_hand_out_each_job_once() {
    let shared = SharedDb::new();
    let queue = job_queue(&shared.first);
    let ids: HashSet<i64> = (0..40)
        .map(|i| queue.enqueue(new_job(&format!("P{}", i)), ts(i)).unwrap().id)
        .collect();

    let barrier = Arc::new(Barrier::new(2));
    let workers: Vec<_> = [shared.first.clone(), shared.second.clone()]
        .into_iter()
        .map(|db| {
            let barrier = barrier.clone();
            thread::spawn(move || {
                let queue = job_queue(&db);
                barrier.wait();
                let mut leased = Vec::new();
                while let Some(job) = queue.lease(ts(100)).unwrap() {
                    assert_eq!(job.state, JobState::Processing);
                    queue.complete(job.id, job.lease_id, ts(101)).unwrap();
                    leased.push(job.id);
                }
                leased
            })
        })
        .collect();

    let mut all: Vec<i64> = workers
        .into_iter()
        .flat_map(|w| w.join().unwrap())
        .collect();
    let total = all.len();
    all.sort_unstable();
    all.dedup();
    assert_eq!(total, 40);
    assert_eq!(all.into_iter().collect::<HashSet<_>>(), ids);

    let completed = queue
        .list(&ListJobsArgs {
            state: Some(JobState::Completed),
            count: Some(1000),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(completed.len(), 40);
}

#[test]
fn test_list_is_capped_and_ordered_by_queue_time() {
    let shared = SharedDb::new();
    let queue = job_queue(&shared.first);
    for i in 0..510 {
        queue.enqueue(new_job("BIG"), ts(510 - i)).unwrap();
    }

    let all = queue
        .list(&ListJobsArgs {
            count: Some(10_000),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(all.len(), 500);
    assert!(all.windows(2).all(|w| w[0].queued_at <= w[1].queued_at));
    assert_eq!(all[0].queued_at, ts(1));

    assert_eq!(queue.list(&ListJobsArgs::default()).unwrap().len(), 100);
    assert!(queue
        .list(&ListJobsArgs {
            project_keys: Some(Vec::new()),
            ..Default::default()
        })
        .unwrap()
        .is_empty());
}

#[test]
fn test_stalled_lease_recovery_until_errored_then_operator_requeue() {
    let shared = SharedDb::new();
    let queue = job_queue(&shared.first);
    let max_resets = queue.retry_policy().max_resets;
    let job = queue.enqueue(new_job("STALL"), ts(0)).unwrap();

    // Another instance leases and dies, over and over
    let crashed = job_queue(&shared.second);
    let mut now = 0;
    for attempt in 0..max_resets {
        let leased = crashed.lease(ts(now)).unwrap().unwrap();
        assert_eq!(leased.id, job.id);
        assert_eq!(leased.num_resets, attempt);

        // Not yet past the stall threshold
        assert_eq!(queue.reset_stalled(ts(now + 599)).unwrap(), StalledReset::default());
        now += 600;
        assert_eq!(
            queue.reset_stalled(ts(now)).unwrap(),
            StalledReset {
                requeued: 1,
                errored: 0
            }
        );
    }

    crashed.lease(ts(now)).unwrap().unwrap();
    now += 600;
    assert_eq!(
        queue.reset_stalled(ts(now)).unwrap(),
        StalledReset {
            requeued: 0,
            errored: 1
        }
    );
    let errored = queue.get(job.id).unwrap();
    assert_eq!(errored.state, JobState::Errored);
    assert_eq!(errored.finished_at, Some(ts(now)));

    // The ceiling also binds the operator
    assert!(matches!(
        queue.requeue(job.id),
        Err(StoreError::InvalidTransition { .. })
    ));
}

#[test]
fn test_slow_instance_cannot_report_after_its_lease_was_taken_over() {
    let shared = SharedDb::new();
    let queue = job_queue(&shared.first);
    let slow = job_queue(&shared.second);
    let job = queue.enqueue(new_job("SLOW"), ts(0)).unwrap();

    let first_lease = slow.lease(ts(100)).unwrap().unwrap();
    queue.reset_stalled(ts(700)).unwrap();
    let second_lease = queue.lease(ts(700)).unwrap().unwrap();
    assert_eq!(second_lease.id, job.id);
    assert_ne!(second_lease.lease_id, first_lease.lease_id);

    // The slow instance wakes up and tries to report
    assert!(matches!(
        slow.fail(job.id, first_lease.lease_id, "timeout", true, ts(710)),
        Err(StoreError::InvalidTransition { .. })
    ));
    assert!(matches!(
        slow.complete(job.id, first_lease.lease_id, ts(710)),
        Err(StoreError::InvalidTransition { .. })
    ));
    let current = queue.get(job.id).unwrap();
    assert_eq!(current.state, JobState::Processing);
    assert_eq!(current.num_failures, 0);

    let done = queue.complete(job.id, second_lease.lease_id, ts(720)).unwrap();
    assert_eq!(done.state, JobState::Completed);
    assert_eq!(done.finished_at, Some(ts(720)));
}

#[test]
fn test_cancel_and_requeue_from_operator() {
    let shared = SharedDb::new();
    let queue = job_queue(&shared.first);

    let queued = queue.enqueue(new_job("A"), ts(0)).unwrap();
    let canceled = queue.cancel(queued.id, ts(1)).unwrap();
    assert_eq!(canceled.state, JobState::Canceled);
    assert_eq!(canceled.finished_at, Some(ts(1)));
    assert!(queue.lease(ts(2)).unwrap().is_none());
    assert!(matches!(
        queue.cancel(queued.id, ts(3)),
        Err(StoreError::InvalidTransition { .. })
    ));
    assert!(matches!(
        queue.requeue(queued.id),
        Err(StoreError::InvalidTransition { .. })
    ));

    let failing = queue.enqueue(new_job("B"), ts(10)).unwrap();
    let lease = queue.lease(ts(11)).unwrap().unwrap();
    let failed = queue.fail(failing.id, lease.lease_id, "project gone", false, ts(12)).unwrap();
    assert_eq!(failed.state, JobState::Failed);

    let requeued = queue.requeue(failing.id).unwrap();
    assert_eq!(requeued.state, JobState::Queued);
    assert_eq!(requeued.num_resets, 1);
    assert_eq!(requeued.process_after, None);
    assert_eq!(queue.lease(ts(13)).unwrap().unwrap().id, failing.id);

    assert!(matches!(queue.cancel(12345, ts(14)), Err(StoreError::UnknownJob(12345))));
}
