//! The maintenance jobs run by `serve`.

pub mod pattern_refresh;
pub mod permission_sync_worker;
pub mod repository_scan;
pub mod stalled_job_resetter;
pub mod staleness_report;
pub mod sync_request_worker;

pub use pattern_refresh::PatternRefreshJob;
pub use permission_sync_worker::PermissionSyncWorkerJob;
pub use repository_scan::{LoggingScanSink, RepositoryScanJob, ScanCandidateSink};
pub use stalled_job_resetter::StalledJobResetterJob;
pub use staleness_report::StalenessReportJob;
pub use sync_request_worker::SyncRequestWorkerJob;

use crate::background_jobs::JobError;
use crate::error::StoreError;
use crate::metrics;

/// Counts the failure and turns it into a job error. The next tick retries.
fn store_failure(operation: &str, err: StoreError) -> JobError {
    metrics::record_store_error(operation, &err);
    if err.is_retryable() {
        JobError::ExecutionFailed(format!("{} hit a busy store: {}", operation, err))
    } else {
        JobError::ExecutionFailed(format!("{} failed: {}", operation, err))
    }
}
