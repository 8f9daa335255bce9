//! Periodic index and retention scans.
//!
//! Each run claims the next batch of due repositories and hands it to a
//! sink. Claims are exclusive across every process sharing the database, so
//! any number of `serve` instances can run this job.

use super::store_failure;
use crate::background_jobs::{
    context::JobContext,
    job::{BackgroundJob, HookEvent, JobError, JobSchedule},
};
use crate::policy::ScanKind;
use crate::scan::{CandidateSelector, ScanOptions};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Receives claimed repositories. Whatever it does with them, the claim is
/// already recorded.
pub trait ScanCandidateSink: Send + Sync {
    fn hand_off(&self, scan_kind: ScanKind, repository_ids: &[i64]) -> Result<(), String>;
}

/// Sink that only logs the claimed batch.
pub struct LoggingScanSink;

impl ScanCandidateSink for LoggingScanSink {
    fn hand_off(&self, scan_kind: ScanKind, repository_ids: &[i64]) -> Result<(), String> {
        info!(
            "Claimed {} repositories for {}: {:?}",
            repository_ids.len(),
            scan_kind,
            repository_ids
        );
        Ok(())
    }
}

pub struct RepositoryScanJob {
    scan_kind: ScanKind,
    selector: Arc<dyn CandidateSelector>,
    sink: Arc<dyn ScanCandidateSink>,
    options: ScanOptions,
    interval: Duration,
}

impl RepositoryScanJob {
    pub fn new(
        scan_kind: ScanKind,
        selector: Arc<dyn CandidateSelector>,
        sink: Arc<dyn ScanCandidateSink>,
        options: ScanOptions,
        interval: Duration,
    ) -> Self {
        Self {
            scan_kind,
            selector,
            sink,
            options,
            interval,
        }
    }
}

impl BackgroundJob for RepositoryScanJob {
    fn id(&self) -> &'static str {
        match self.scan_kind {
            ScanKind::Indexing => "index_scan",
            ScanKind::Retention => "retention_scan",
        }
    }

    fn name(&self) -> &'static str {
        match self.scan_kind {
            ScanKind::Indexing => "Index Scan",
            ScanKind::Retention => "Retention Scan",
        }
    }

    fn description(&self) -> &'static str {
        match self.scan_kind {
            ScanKind::Indexing => "Claim repositories due for indexing",
            ScanKind::Retention => "Claim fresh repositories due for data retention",
        }
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

        let claimed = self
            .selector
            .select_and_claim(self.scan_kind, &self.options, ctx.now())
            .map_err(|e| store_failure(self.id(), e))?;
        if claimed.is_empty() {
            return Ok(());
        }

        self.sink
            .hand_off(self.scan_kind, &claimed)
            .map_err(JobError::ExecutionFailed)
    }
}
