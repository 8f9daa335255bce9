//! Retryable permission sync jobs: leasing, backoff and the reset ceiling.

mod models;
mod queue_store;
mod retry_policy;

pub use models::*;
pub(crate) use queue_store::enqueue;
pub use queue_store::SqliteJobQueue;
pub use retry_policy::RetryPolicy;

use crate::error::StoreResult;
use chrono::{DateTime, Utc};

/// Result of one stalled-lease sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StalledReset {
    pub requeued: usize,
    pub errored: usize,
}

/// Permission sync job state machine.
///
/// `Queued -> Processing -> {Completed, Canceled, Errored, Failed}`, with
/// `Errored | Failed -> Queued` bounded by the reset ceiling. Wrong-state
/// calls return `InvalidTransition`, missing jobs `UnknownJob`.
pub trait JobQueue: Send + Sync {
    fn enqueue(&self, job: NewPermissionJob, now: DateTime<Utc>) -> StoreResult<PermissionSyncJob>;

    /// Atomically takes the oldest queued job whose `process_after` has
    /// passed at `now` and starts a new lease on it.
    fn lease(&self, now: DateTime<Utc>) -> StoreResult<Option<PermissionSyncJob>>;

    /// `lease_id` is the one returned by `lease`. A report on a lease that a
    /// stall reset has since taken away is `InvalidTransition`.
    fn complete(&self, job_id: i64, lease_id: i64, now: DateTime<Utc>) -> StoreResult<PermissionSyncJob>;

    /// Retryable failures under the ceiling go back to `Queued` with an
    /// exponential `process_after`; anything else ends in `Failed`. Same
    /// lease rule as `complete`.
    fn fail(
        &self,
        job_id: i64,
        lease_id: i64,
        message: &str,
        retryable: bool,
        now: DateTime<Utc>,
    ) -> StoreResult<PermissionSyncJob>;

    /// Only queued jobs can be canceled.
    fn cancel(&self, job_id: i64, now: DateTime<Utc>) -> StoreResult<PermissionSyncJob>;

    /// Operator reset of an `Errored` or `Failed` job.
    fn requeue(&self, job_id: i64) -> StoreResult<PermissionSyncJob>;

    /// Returns expired leases to the queue, or to `Errored` when no resets
    /// are left.
    fn reset_stalled(&self, now: DateTime<Utc>) -> StoreResult<StalledReset>;

    fn get(&self, job_id: i64) -> StoreResult<PermissionSyncJob>;
    fn list(&self, args: &ListJobsArgs) -> StoreResult<Vec<PermissionSyncJob>>;
}
