//! Serves immediate repository and user sync requests.

use super::store_failure;
use crate::background_jobs::{
    context::JobContext,
    job::{BackgroundJob, JobError, JobSchedule},
};
use crate::code_host::CodeHostClient;
use crate::error::StoreError;
use crate::sync::{SyncRequestQueue, SyncTarget};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub struct SyncRequestWorkerJob {
    requests: Arc<dyn SyncRequestQueue>,
    client: Arc<dyn CodeHostClient>,
    batch_size: usize,
    interval: Duration,
}

impl SyncRequestWorkerJob {
    pub fn new(
        requests: Arc<dyn SyncRequestQueue>,
        client: Arc<dyn CodeHostClient>,
        batch_size: usize,
        interval: Duration,
    ) -> Self {
        Self {
            requests,
            client,
            batch_size,
            interval,
        }
    }
}

impl BackgroundJob for SyncRequestWorkerJob {
    fn id(&self) -> &'static str {
        "sync_request_worker"
    }

    fn name(&self) -> &'static str {
        "Sync Request Worker"
    }

    fn description(&self) -> &'static str {
        "Run pending repository and user permission syncs"
    }

    fn schedule(&self) -> JobSchedule {
        JobSchedule::Interval(self.interval)
    }

    fn execute(&self, ctx: &JobContext) -> Result<(), JobError> {
        let mut processed = 0;

        for _ in 0..self.batch_size {
            if ctx.is_cancelled() {
                return Err(JobError::Cancelled);
            }

            let Some(request) = self
                .requests
                .claim_next(ctx.now())
                .map_err(|e| store_failure("claim_sync_request", e))?
            else {
                break;
            };

            let result = match request.target {
                SyncTarget::Repository(repository_id) => {
                    self.client.sync_repository_permissions(repository_id)
                }
                SyncTarget::User(user_id) => self
                    .client
                    .sync_user_permissions(user_id, request.invalidate_caches),
            };

            let message = match &result {
                Ok(()) => None,
                Err(failure) => {
                    warn!("Sync request {} for {:?} failed: {}", request.id, request.target, failure);
                    Some(failure.message.as_str())
                }
            };
            match self
                .requests
                .finish(request.id, result.is_ok(), message, ctx.now())
            {
                Ok(_) => processed += 1,
                Err(StoreError::InvalidTransition { .. }) => {
                    warn!("Claim on sync request {} expired, dropping the result", request.id)
                }
                Err(e) => return Err(store_failure("finish_sync_request", e)),
            }
        }

        if processed > 0 {
            info!("Processed {} sync requests", processed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{context_at, ts, Call, FakeCodeHost};
    use super::*;
    use crate::code_host::SyncFailure;
    use crate::permission_jobs::{RetryPolicy, SqliteJobQueue};
    use crate::repos::{Repository, RepositoryDirectory, SqliteRepositoryDirectory};
    use crate::staleness::{SqliteStalenessStore, StalenessStore};
    use crate::store::UpkeepDb;
    use crate::sync::{RequestState, SqliteSyncOrchestrator, SqliteSyncRequestQueue, SyncOrchestrator};

    #[test]
    fn test_worker_runs_requests_and_clears_staleness() {
        let db = UpkeepDb::in_memory().unwrap();
        let directory = SqliteRepositoryDirectory::new(db.clone());
        directory.upsert(&Repository::new(1, "r1")).unwrap();
        directory.upsert(&Repository::new(2, "r2")).unwrap();

        let orchestrator = SqliteSyncOrchestrator::new(
            db.clone(),
            Arc::new(SqliteJobQueue::new(
                db.clone(),
                RetryPolicy::default(),
                Duration::from_secs(600),
            )),
        );
        orchestrator.schedule_repository_sync(1, ts(1)).unwrap();
        orchestrator.schedule_repository_sync(2, ts(2)).unwrap();
        orchestrator.schedule_user_sync(9, true, ts(3)).unwrap();

        let requests = Arc::new(SqliteSyncRequestQueue::new(db.clone()));
        let client = Arc::new(FakeCodeHost::failing_with(vec![
            Ok(()),
            Err(SyncFailure::retryable("code host down")),
        ]));
        let worker = SyncRequestWorkerJob::new(requests.clone(), client.clone(), 10, Duration::from_secs(1));

        let (ctx, _clock) = context_at(10);
        worker.execute(&ctx).unwrap();

        assert_eq!(
            client.calls(),
            vec![Call::Repository(1), Call::Repository(2), Call::User(9, true)]
        );
        assert!(requests.list_pending().unwrap().is_empty());

        let dirty = SqliteStalenessStore::new(db).list_dirty().unwrap();
        assert!(!dirty.contains_key(&1));
        assert!(dirty.contains_key(&2));

        let failed = requests.get(2).unwrap();
        assert_eq!(failed.state, RequestState::Failed);
        assert_eq!(failed.failure_message.as_deref(), Some("code host down"));
    }
}
