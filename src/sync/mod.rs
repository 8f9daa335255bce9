//! Entry points for permission sync requests.

mod models;
mod orchestrator;
mod requests;

pub use models::*;
pub use orchestrator::SqliteSyncOrchestrator;
pub use requests::SqliteSyncRequestQueue;

use crate::error::StoreResult;
use crate::permission_jobs::{ListJobsArgs, PermissionSyncJob, UserPermission};
use chrono::{DateTime, Utc};

pub trait SyncOrchestrator: Send + Sync {
    /// Marks the repository dirty and queues an immediate sync, unless one is
    /// already pending.
    fn schedule_repository_sync(
        &self,
        repository_id: i64,
        now: DateTime<Utc>,
    ) -> StoreResult<SyncOutcome>;

    /// Users live in an external directory and are not validated here.
    fn schedule_user_sync(
        &self,
        user_id: i64,
        invalidate_caches: bool,
        now: DateTime<Utc>,
    ) -> StoreResult<SyncOutcome>;

    /// Replaces the explicit permissions of every live repository in the
    /// project and queues one bookkeeping job, all in one transaction.
    /// A project with no live repositories is `UnknownProject`.
    fn set_bitbucket_project_permissions(
        &self,
        project_key: &str,
        external_service_id: i64,
        user_permissions: Vec<UserPermission>,
        unrestricted: Option<bool>,
        now: DateTime<Utc>,
    ) -> StoreResult<PermissionSyncJob>;

    fn list_bitbucket_project_permission_jobs(
        &self,
        args: &ListJobsArgs,
    ) -> StoreResult<Vec<PermissionSyncJob>>;

    /// Explicit permissions of one repository as a consistent snapshot.
    fn repository_permissions(&self, repository_id: i64) -> StoreResult<Option<RepositoryPermissions>>;
}

/// Result of one stalled-claim sweep over sync requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StalledRequests {
    /// Expired claims that were queued again as a fresh pending request.
    pub requeued: usize,
    /// Expired claims whose target already had a pending request.
    pub merged: usize,
}

/// Worker side of the immediate sync requests.
pub trait SyncRequestQueue: Send + Sync {
    /// Moves the oldest pending request to processing. Repository requests
    /// carry the dirty token observed at claim time.
    fn claim_next(&self, now: DateTime<Utc>) -> StoreResult<Option<SyncRequest>>;

    /// Closes a processing request. A successful repository request consumes
    /// its observed token.
    fn finish(
        &self,
        request_id: i64,
        succeeded: bool,
        message: Option<&str>,
        now: DateTime<Utc>,
    ) -> StoreResult<SyncRequest>;

    /// Fails processing requests claimed before the stall threshold and
    /// queues their target again, folding into an existing pending request
    /// for the same target. A late `finish` on a failed claim is rejected.
    fn reset_stalled(&self, now: DateTime<Utc>) -> StoreResult<StalledRequests>;

    fn get(&self, request_id: i64) -> StoreResult<SyncRequest>;
    fn list_pending(&self) -> StoreResult<Vec<SyncRequest>>;
}
