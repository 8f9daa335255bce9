//! Keeps pattern policy membership in step with the repository directory.

use super::store_failure;
use crate::background_jobs::{
    context::JobContext,
    job::{BackgroundJob, HookEvent, JobError, JobSchedule},
};
use crate::policy::PolicyEngine;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub struct PatternRefreshJob {
    policies: Arc<dyn PolicyEngine>,
    interval: Duration,
}

impl PatternRefreshJob {
    pub fn new(policies: Arc<dyn PolicyEngine>, interval: Duration) -> Self {
        Self { policies, interval }
    }
}

impl BackgroundJob for PatternRefreshJob {
    fn id(&self) -> &'static str {
        "pattern_refresh"
    }

    fn name(&self) -> &'static str {
        "Pattern Refresh"
    }

    fn description(&self) -> &'static str {
        "Recompute repository matches of pattern policies"
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
        let matches = self
            .policies
            .refresh_all_pattern_matches()
            .map_err(|e| store_failure("refresh_pattern_matches", e))?;
        info!("Refreshed pattern policies: {} repository matches", matches);
        Ok(())
    }
}
