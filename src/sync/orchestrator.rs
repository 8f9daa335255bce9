use super::models::{RepositoryPermissions, SyncOutcome, SyncTarget};
use super::requests::enqueue_request;
use super::SyncOrchestrator;
use crate::error::{StoreError, StoreResult};
use crate::metrics;
use crate::permission_jobs::{
    self, ListJobsArgs, NewPermissionJob, Permission, PermissionSyncJob, UserPermission,
};
use crate::repos::{ensure_present, live_project_repository_ids};
use crate::sqlite_persistence::{from_unix, to_unix};
use crate::staleness;
use crate::store::UpkeepDb;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension};
use std::sync::Arc;
use tracing::info;

/// Translates external sync requests into staleness marks, immediate
/// requests and queued permission jobs.
pub struct SqliteSyncOrchestrator {
    db: UpkeepDb,
    jobs: Arc<dyn permission_jobs::JobQueue>,
}

impl SqliteSyncOrchestrator {
    pub fn new(db: UpkeepDb, jobs: Arc<dyn permission_jobs::JobQueue>) -> Self {
        Self { db, jobs }
    }
}

impl SyncOrchestrator for SqliteSyncOrchestrator {
    fn schedule_repository_sync(
        &self,
        repository_id: i64,
        now: DateTime<Utc>,
    ) -> StoreResult<SyncOutcome> {
        let outcome = self.db.write(|tx| {
            ensure_present(tx, repository_id)?;
            let outcome = enqueue_request(tx, SyncTarget::Repository(repository_id), false, now)?;
            if outcome == SyncOutcome::Accepted {
                staleness::mark_dirty(tx, repository_id, now)?;
            }
            Ok(outcome)
        })?;
        metrics::record_sync_request("repository", outcome_label(outcome));
        Ok(outcome)
    }

    fn schedule_user_sync(
        &self,
        user_id: i64,
        invalidate_caches: bool,
        now: DateTime<Utc>,
    ) -> StoreResult<SyncOutcome> {
        let outcome = self
            .db
            .write(|tx| enqueue_request(tx, SyncTarget::User(user_id), invalidate_caches, now))?;
        metrics::record_sync_request("user", outcome_label(outcome));
        Ok(outcome)
    }

    fn set_bitbucket_project_permissions(
        &self,
        project_key: &str,
        external_service_id: i64,
        user_permissions: Vec<UserPermission>,
        unrestricted: Option<bool>,
        now: DateTime<Utc>,
    ) -> StoreResult<PermissionSyncJob> {
        let unrestricted = unrestricted.unwrap_or(false);
        let (job_id, repo_count) = self.db.write(|tx| {
            let repository_ids = live_project_repository_ids(tx, external_service_id, project_key)?;
            if repository_ids.is_empty() {
                return Err(StoreError::UnknownProject {
                    project_key: project_key.to_string(),
                    external_service_id,
                });
            }

            let job_id = permission_jobs::enqueue(
                tx,
                &NewPermissionJob {
                    project_key: project_key.to_string(),
                    external_service_id,
                    permissions: user_permissions.clone(),
                    unrestricted,
                },
                now,
            )?;

            let mut clear = tx.prepare("DELETE FROM repo_permissions WHERE repository_id = ?1")?;
            let mut insert = tx.prepare(
                "INSERT INTO repo_permissions (repository_id, bind_id, permission)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT (repository_id, bind_id) DO UPDATE SET permission = excluded.permission",
            )?;
            let mut set_meta = tx.prepare(
                "INSERT INTO repo_permission_sets (repository_id, unrestricted, updated_at, source_job_id)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (repository_id) DO UPDATE SET
                    unrestricted = excluded.unrestricted,
                    updated_at = excluded.updated_at,
                    source_job_id = excluded.source_job_id",
            )?;
            for repository_id in &repository_ids {
                clear.execute(params![repository_id])?;
                for permission in &user_permissions {
                    insert.execute(params![
                        repository_id,
                        permission.bind_id,
                        permission.permission.as_str()
                    ])?;
                }
                set_meta.execute(params![repository_id, unrestricted, to_unix(now), job_id])?;
            }
            Ok((job_id, repository_ids.len()))
        })?;

        info!(
            "Set {} permissions on {} repositories of project {} (job {})",
            user_permissions.len(),
            repo_count,
            project_key,
            job_id
        );
        self.jobs.get(job_id)
    }

    fn list_bitbucket_project_permission_jobs(
        &self,
        args: &ListJobsArgs,
    ) -> StoreResult<Vec<PermissionSyncJob>> {
        self.jobs.list(args)
    }

    fn repository_permissions(&self, repository_id: i64) -> StoreResult<Option<RepositoryPermissions>> {
        self.db.read(|conn| {
            ensure_present(conn, repository_id)?;
            let meta = conn
                .query_row(
                    "SELECT unrestricted, updated_at, source_job_id
                     FROM repo_permission_sets WHERE repository_id = ?1",
                    params![repository_id],
                    |row| {
                        Ok((
                            row.get::<_, bool>(0)?,
                            from_unix(1, row.get(1)?)?,
                            row.get::<_, Option<i64>>(2)?,
                        ))
                    },
                )
                .optional()?;
            let Some((unrestricted, updated_at, source_job_id)) = meta else {
                return Ok(None);
            };

            let mut stmt = conn.prepare(
                "SELECT bind_id, permission FROM repo_permissions
                 WHERE repository_id = ?1 ORDER BY bind_id",
            )?;
            let permissions = stmt
                .query_map(params![repository_id], |row| {
                    let raw: String = row.get(1)?;
                    let permission = Permission::parse(&raw).ok_or_else(|| {
                        rusqlite::Error::FromSqlConversionFailure(
                            1,
                            Type::Text,
                            format!("unknown permission '{}'", raw).into(),
                        )
                    })?;
                    Ok(UserPermission {
                        bind_id: row.get(0)?,
                        permission,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            Ok(Some(RepositoryPermissions {
                repository_id,
                unrestricted,
                updated_at,
                source_job_id,
                permissions,
            }))
        })
    }
}

fn outcome_label(outcome: SyncOutcome) -> &'static str {
    match outcome {
        SyncOutcome::Accepted => "accepted",
        SyncOutcome::AlreadyPending => "already_pending",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permission_jobs::{JobState, RetryPolicy, SqliteJobQueue};
    use crate::repos::{Repository, RepositoryDirectory, SqliteRepositoryDirectory};
    use crate::staleness::{SqliteStalenessStore, StalenessStore};
    use crate::sync::{RequestState, SqliteSyncRequestQueue, StalledRequests, SyncRequestQueue};
    use std::time::Duration;

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    struct Fixture {
        orchestrator: SqliteSyncOrchestrator,
        requests: SqliteSyncRequestQueue,
        staleness: SqliteStalenessStore,
        directory: SqliteRepositoryDirectory,
    }

    fn fixture() -> Fixture {
        let db = UpkeepDb::in_memory().unwrap();
        let directory = SqliteRepositoryDirectory::new(db.clone());
        directory
            .upsert(&Repository::new(1, "bb/PROJ/one").in_project(7, "PROJ"))
            .unwrap();
        directory
            .upsert(&Repository::new(2, "bb/PROJ/two").in_project(7, "PROJ"))
            .unwrap();
        directory
            .upsert(&Repository::new(3, "bb/OTHER/three").in_project(7, "OTHER"))
            .unwrap();
        let jobs = Arc::new(SqliteJobQueue::new(
            db.clone(),
            RetryPolicy::default(),
            Duration::from_secs(600),
        ));
        Fixture {
            orchestrator: SqliteSyncOrchestrator::new(db.clone(), jobs),
            requests: SqliteSyncRequestQueue::new(db.clone()),
            staleness: SqliteStalenessStore::new(db),
            directory,
        }
    }

    #[test]
    fn test_repository_sync_is_idempotent_while_pending() {
        let f = fixture();
        assert_eq!(
            f.orchestrator.schedule_repository_sync(1, ts(10)).unwrap(),
            SyncOutcome::Accepted
        );
        assert_eq!(
            f.orchestrator.schedule_repository_sync(1, ts(20)).unwrap(),
            SyncOutcome::AlreadyPending
        );
        assert_eq!(f.requests.list_pending().unwrap().len(), 1);

        let record = f.staleness.get_dirty_record(1).unwrap().unwrap();
        assert_eq!(record.generation.dirty_token(), 1);
        assert_eq!(record.set_dirty_at, Some(ts(10)));
    }

    #[test]
    fn test_repository_sync_for_unknown_repository() {
        let f = fixture();
        assert!(matches!(
            f.orchestrator.schedule_repository_sync(99, ts(10)),
            Err(StoreError::UnknownRepository(99))
        ));
        f.directory.soft_delete(2, ts(5)).unwrap();
        assert!(f
            .orchestrator
            .schedule_repository_sync(2, ts(10))
            .unwrap_err()
            .is_unknown_resource());
    }

    #[test]
    fn test_claimed_request_no_longer_blocks_new_ones() {
        let f = fixture();
        f.orchestrator.schedule_repository_sync(1, ts(10)).unwrap();
        let claimed = f.requests.claim_next(ts(11)).unwrap().unwrap();
        assert_eq!(claimed.state, RequestState::Processing);
        assert_eq!(claimed.observed_token, Some(1));

        assert_eq!(
            f.orchestrator.schedule_repository_sync(1, ts(12)).unwrap(),
            SyncOutcome::Accepted
        );
    }

    #[test]
    fn test_successful_request_consumes_observed_token() {
        let f = fixture();
        f.orchestrator.schedule_repository_sync(1, ts(10)).unwrap();
        let claimed = f.requests.claim_next(ts(11)).unwrap().unwrap();

        let finished = f.requests.finish(claimed.id, true, None, ts(12)).unwrap();
        assert_eq!(finished.state, RequestState::Completed);
        assert!(f.staleness.list_dirty().unwrap().is_empty());
    }

    #[test]
    fn test_mark_during_sync_keeps_repository_dirty() {
        let f = fixture();
        f.orchestrator.schedule_repository_sync(1, ts(10)).unwrap();
        let claimed = f.requests.claim_next(ts(11)).unwrap().unwrap();
        f.staleness.mark_dirty(1, ts(12)).unwrap();

        f.requests.finish(claimed.id, true, None, ts(13)).unwrap();
        assert_eq!(f.staleness.list_dirty().unwrap().get(&1), Some(&2));
    }

    #[test]
    fn test_failed_request_leaves_repository_dirty() {
        let f = fixture();
        f.orchestrator.schedule_repository_sync(1, ts(10)).unwrap();
        let claimed = f.requests.claim_next(ts(11)).unwrap().unwrap();
        let finished = f
            .requests
            .finish(claimed.id, false, Some("timeout"), ts(12))
            .unwrap();
        assert_eq!(finished.state, RequestState::Failed);
        assert_eq!(finished.failure_message.as_deref(), Some("timeout"));
        assert!(f.staleness.list_dirty().unwrap().contains_key(&1));

        assert!(matches!(
            f.requests.finish(claimed.id, true, None, ts(13)),
            Err(StoreError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_expired_claim_is_requeued_and_late_finish_rejected() {
        let f = fixture();
        f.orchestrator.schedule_repository_sync(1, ts(10)).unwrap();
        let claimed = f.requests.claim_next(ts(11)).unwrap().unwrap();

        assert_eq!(f.requests.reset_stalled(ts(610)).unwrap(), StalledRequests::default());
        assert_eq!(
            f.requests.reset_stalled(ts(611)).unwrap(),
            StalledRequests {
                requeued: 1,
                merged: 0
            }
        );
        let expired = f.requests.get(claimed.id).unwrap();
        assert_eq!(expired.state, RequestState::Failed);
        assert_eq!(expired.finished_at, Some(ts(611)));
        assert_eq!(expired.failure_message.as_deref(), Some("claim expired"));

        let pending = f.requests.list_pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_ne!(pending[0].id, claimed.id);
        assert_eq!(pending[0].target, SyncTarget::Repository(1));

        // The worker holding the expired claim finally returns
        assert!(matches!(
            f.requests.finish(claimed.id, true, None, ts(612)),
            Err(StoreError::InvalidTransition { .. })
        ));
        assert!(f.staleness.list_dirty().unwrap().contains_key(&1));

        let retry = f.requests.claim_next(ts(613)).unwrap().unwrap();
        assert_eq!(retry.id, pending[0].id);
        f.requests.finish(retry.id, true, None, ts(614)).unwrap();
        assert!(f.staleness.list_dirty().unwrap().is_empty());
    }

    #[test]
    fn test_expired_claim_folds_into_pending_duplicate() {
        let f = fixture();
        f.orchestrator.schedule_user_sync(42, true, ts(1)).unwrap();
        let claimed = f.requests.claim_next(ts(2)).unwrap().unwrap();
        f.orchestrator.schedule_user_sync(42, false, ts(3)).unwrap();

        let requests = f.requests.clone().with_stall_threshold(Duration::from_secs(60));
        assert_eq!(
            requests.reset_stalled(ts(100)).unwrap(),
            StalledRequests {
                requeued: 0,
                merged: 1
            }
        );
        assert_eq!(f.requests.get(claimed.id).unwrap().state, RequestState::Failed);

        let pending = f.requests.list_pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].target, SyncTarget::User(42));
        assert_eq!(pending[0].queued_at, ts(3));
        assert!(pending[0].invalidate_caches);
    }

    #[test]
    fn test_user_sync_dedup_merges_cache_invalidation() {
        let f = fixture();
        assert_eq!(
            f.orchestrator.schedule_user_sync(42, false, ts(1)).unwrap(),
            SyncOutcome::Accepted
        );
        assert_eq!(
            f.orchestrator.schedule_user_sync(42, true, ts(2)).unwrap(),
            SyncOutcome::AlreadyPending
        );
        assert_eq!(
            f.orchestrator.schedule_user_sync(43, false, ts(3)).unwrap(),
            SyncOutcome::Accepted
        );

        let pending = f.requests.list_pending().unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].target, SyncTarget::User(42));
        assert!(pending[0].invalidate_caches);

        let claimed = f.requests.claim_next(ts(4)).unwrap().unwrap();
        assert_eq!(claimed.target, SyncTarget::User(42));
        assert_eq!(claimed.observed_token, None);
    }

    #[test]
    fn test_project_permissions_cover_every_project_repository() {
        let f = fixture();
        let job = f
            .orchestrator
            .set_bitbucket_project_permissions(
                "PROJ",
                7,
                vec![
                    UserPermission::new("alice", Permission::Read),
                    UserPermission::new("bob", Permission::Write),
                ],
                None,
                ts(100),
            )
            .unwrap();
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.project_key, "PROJ");
        assert!(!job.unrestricted);

        for repository_id in [1, 2] {
            let perms = f
                .orchestrator
                .repository_permissions(repository_id)
                .unwrap()
                .unwrap();
            assert_eq!(perms.source_job_id, Some(job.id));
            assert_eq!(perms.permissions.len(), 2);
            assert_eq!(perms.permissions[0].bind_id, "alice");
        }
        assert!(f.orchestrator.repository_permissions(3).unwrap().is_none());

        // A second call replaces the previous set
        f.orchestrator
            .set_bitbucket_project_permissions(
                "PROJ",
                7,
                vec![UserPermission::new("carol", Permission::Admin)],
                Some(true),
                ts(200),
            )
            .unwrap();
        let perms = f.orchestrator.repository_permissions(1).unwrap().unwrap();
        assert!(perms.unrestricted);
        assert_eq!(perms.updated_at, ts(200));
        assert_eq!(
            perms.permissions,
            vec![UserPermission::new("carol", Permission::Admin)]
        );

        let jobs = f
            .orchestrator
            .list_bitbucket_project_permission_jobs(&ListJobsArgs {
                project_keys: Some(vec!["PROJ".to_string()]),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(jobs.len(), 2);
    }

    #[test]
    fn test_unknown_project_writes_nothing() {
        let f = fixture();
        let err = f
            .orchestrator
            .set_bitbucket_project_permissions(
                "NOPE",
                7,
                vec![UserPermission::new("alice", Permission::Read)],
                None,
                ts(1),
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownProject { .. }));
        assert!(f
            .orchestrator
            .list_bitbucket_project_permission_jobs(&ListJobsArgs::default())
            .unwrap()
            .is_empty());
    }
}
