//! Returns permission jobs and sync requests whose worker died mid-lease to
//! the queue.

use super::store_failure;
use crate::background_jobs::{
    context::JobContext,
    job::{BackgroundJob, HookEvent, JobError, JobSchedule},
};
use crate::permission_jobs::JobQueue;
use crate::sync::SyncRequestQueue;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub struct StalledJobResetterJob {
    queue: Arc<dyn JobQueue>,
    requests: Arc<dyn SyncRequestQueue>,
    interval: Duration,
}

impl StalledJobResetterJob {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        requests: Arc<dyn SyncRequestQueue>,
        interval: Duration,
    ) -> Self {
        Self {
            queue,
            requests,
            interval,
        }
    }
}

impl BackgroundJob for StalledJobResetterJob {
    fn id(&self) -> &'static str {
        "stalled_job_resetter"
    }

    fn name(&self) -> &'static str {
        "Stalled Job Resetter"
    }

    fn description(&self) -> &'static str {
        "Requeue permission jobs and sync requests whose lease expired"
    }

    fn schedule(&self) -> JobSchedule {
        JobSchedule::Combined {
            interval: Some(self.interval),
            hooks: vec![HookEvent::OnStartup],
        }
    }

    fn execute(&self, ctx: &JobContext) -> Result<(), JobError> {
        if ctx.is_cancelled() {
            return Err(JobError::Cancelled);
        }

        let reset = self
            .queue
            .reset_stalled(ctx.now())
            .map_err(|e| store_failure("reset_stalled_jobs", e))?;

        if reset.requeued > 0 {
            info!("Requeued {} stalled permission jobs", reset.requeued);
        }
        if reset.errored > 0 {
            warn!(
                "{} stalled permission jobs ran out of resets and are now errored",
                reset.errored
            );
        }

        let requests = self
            .requests
            .reset_stalled(ctx.now())
            .map_err(|e| store_failure("reset_stalled_sync_requests", e))?;
        if requests.requeued + requests.merged > 0 {
            info!(
                "Requeued {} stalled sync requests ({} merged into pending ones)",
                requests.requeued + requests.merged,
                requests.merged
            );
        }
        Ok(())
    }
}
