//! Drains the permission sync job queue against the code host.

use super::store_failure;
use crate::background_jobs::{
    context::JobContext,
    job::{BackgroundJob, JobError, JobSchedule},
};
use crate::code_host::CodeHostClient;
use crate::error::StoreError;
use crate::permission_jobs::JobQueue;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub struct PermissionSyncWorkerJob {
    queue: Arc<dyn JobQueue>,
    client: Arc<dyn CodeHostClient>,
    batch_size: usize,
    interval: Duration,
}

impl PermissionSyncWorkerJob {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        client: Arc<dyn CodeHostClient>,
        batch_size: usize,
        interval: Duration,
    ) -> Self {
        Self {
            queue,
            client,
            batch_size,
            interval,
        }
    }
}

impl BackgroundJob for PermissionSyncWorkerJob {
    fn id(&self) -> &'static str {
        "permission_sync_worker"
    }

    fn name(&self) -> &'static str {
        "Permission Sync Worker"
    }

    fn description(&self) -> &'static str {
        "Apply queued project permission jobs on the code host"
    }

    fn schedule(&self) -> JobSchedule {
        JobSchedule::Interval(self.interval)
    }

    fn execute(&self, ctx: &JobContext) -> Result<(), JobError> {
        let mut completed = 0;
        let mut failed = 0;
        let mut lost = 0;

        for _ in 0..self.batch_size {
            // A leased job is never abandoned midway; cancel between jobs only
            if ctx.is_cancelled() {
                return Err(JobError::Cancelled);
            }

            let Some(job) = self
                .queue
                .lease(ctx.now())
                .map_err(|e| store_failure("lease_permission_job", e))?
            else {
                break;
            };

            let reported = match self.client.apply_project_permissions(&job) {
                Ok(()) => self
                    .queue
                    .complete(job.id, job.lease_id, ctx.now())
                    .map(|_| completed += 1),
                Err(failure) => {
                    warn!(
                        "Permission job {} for project {} failed: {}",
                        job.id, job.project_key, failure
                    );
                    self.queue
                        .fail(job.id, job.lease_id, &failure.message, failure.retryable, ctx.now())
                        .map(|_| failed += 1)
                }
            };
            match reported {
                Ok(()) => {}
                // A stall reset took the job away while the code host call ran
                Err(StoreError::InvalidTransition { .. }) => {
                    warn!("Lost the lease on permission job {}, dropping the result", job.id);
                    lost += 1;
                }
                Err(e) => return Err(store_failure("report_permission_job", e)),
            }
        }

        if completed + failed + lost > 0 {
            info!(
                "Processed permission jobs: {} completed, {} failed, {} lost",
                completed, failed, lost
            );
        }
        Ok(())
    }
}
