//! Publishes the staleness gauges.

use super::store_failure;
use crate::background_jobs::{
    context::JobContext,
    job::{BackgroundJob, JobError, JobSchedule},
};
use crate::metrics;
use crate::staleness::StalenessStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub struct StalenessReportJob {
    staleness: Arc<dyn StalenessStore>,
    interval: Duration,
}

impl StalenessReportJob {
    pub fn new(staleness: Arc<dyn StalenessStore>, interval: Duration) -> Self {
        Self {
            staleness,
            interval,
        }
    }
}

impl BackgroundJob for StalenessReportJob {
    fn id(&self) -> &'static str {
        "staleness_report"
    }

    fn name(&self) -> &'static str {
        "Staleness Report"
    }

    fn description(&self) -> &'static str {
        "Export the dirty repository count and the oldest stale age"
    }

    fn schedule(&self) -> JobSchedule {
        JobSchedule::Interval(self.interval)
    }

    fn execute(&self, ctx: &JobContext) -> Result<(), JobError> {
        let now = ctx.now();
        let dirty = self
            .staleness
            .list_dirty()
            .map_err(|e| store_failure("list_dirty", e))?;
        let max_age = self
            .staleness
            .max_stale_age(now)
            .map_err(|e| store_failure("max_stale_age", e))?;

        debug!(
            "{} dirty repositories, oldest stale for {:?}",
            dirty.len(),
            max_age
        );
        metrics::set_staleness(dirty.len(), max_age);
        Ok(())
    }
}
