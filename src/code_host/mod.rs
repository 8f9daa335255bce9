//! Client side of the code host that actually applies permissions.

mod http_client;

pub use http_client::HttpCodeHostClient;

use crate::permission_jobs::PermissionSyncJob;
use std::fmt;

/// A failed call to the code host. Only `retryable` matters to the job queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncFailure {
    pub message: String,
    pub retryable: bool,
}

impl SyncFailure {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl fmt::Display for SyncFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.retryable { "retryable" } else { "terminal" };
        write!(f, "{} ({})", self.message, kind)
    }
}

impl std::error::Error for SyncFailure {}

/// Calls are synchronous; background jobs invoke them from blocking threads.
pub trait CodeHostClient: Send + Sync {
    fn apply_project_permissions(&self, job: &PermissionSyncJob) -> Result<(), SyncFailure>;

    fn sync_repository_permissions(&self, repository_id: i64) -> Result<(), SyncFailure>;

    fn sync_user_permissions(&self, user_id: i64, invalidate_caches: bool) -> Result<(), SyncFailure>;
}
