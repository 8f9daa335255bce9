use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a permission sync job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Queued,
    Processing,
    Completed,
    Canceled,
    Errored,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "QUEUED",
            JobState::Processing => "PROCESSING",
            JobState::Completed => "COMPLETED",
            JobState::Canceled => "CANCELED",
            JobState::Errored => "ERRORED",
            JobState::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "QUEUED" => Some(JobState::Queued),
            "PROCESSING" => Some(JobState::Processing),
            "COMPLETED" => Some(JobState::Completed),
            "CANCELED" => Some(JobState::Canceled),
            "ERRORED" => Some(JobState::Errored),
            "FAILED" => Some(JobState::Failed),
            _ => None,
        }
    }

    /// Whether a worker could still pick the job up without operator action.
    pub fn is_active(&self) -> bool {
        matches!(self, JobState::Queued | JobState::Processing)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Permission {
    Read,
    Write,
    Admin,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::Read => "READ",
            Permission::Write => "WRITE",
            Permission::Admin => "ADMIN",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "READ" => Some(Permission::Read),
            "WRITE" => Some(Permission::Write),
            "ADMIN" => Some(Permission::Admin),
            _ => None,
        }
    }
}

/// One user's permission on every repository of a project. `bind_id` is the
/// user's identity on the code host (username or email).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPermission {
    pub bind_id: String,
    pub permission: Permission,
}

impl UserPermission {
    pub fn new(bind_id: impl Into<String>, permission: Permission) -> Self {
        Self {
            bind_id: bind_id.into(),
            permission,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionSyncJob {
    pub id: i64,
    pub state: JobState,
    pub failure_message: Option<String>,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub process_after: Option<DateTime<Utc>>,
    pub num_resets: i64,
    pub num_failures: i64,
    pub project_key: String,
    #[serde(rename = "externalServiceID")]
    pub external_service_id: i64,
    pub permissions: Vec<UserPermission>,
    pub unrestricted: bool,
    /// Identifies the current lease. `complete` and `fail` must present it.
    pub lease_id: i64,
}

/// Input for `enqueue`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPermissionJob {
    pub project_key: String,
    pub external_service_id: i64,
    pub permissions: Vec<UserPermission>,
    pub unrestricted: bool,
}

pub const DEFAULT_LIST_COUNT: usize = 100;
pub const MAX_LIST_COUNT: usize = 500;

/// Filters for listing jobs. Missing filters match everything.
#[derive(Debug, Clone, Default)]
pub struct ListJobsArgs {
    pub project_keys: Option<Vec<String>>,
    pub state: Option<JobState>,
    pub count: Option<usize>,
}

impl ListJobsArgs {
    /// Requested page size, defaulted and capped.
    pub fn effective_count(&self) -> usize {
        self.count
            .unwrap_or(DEFAULT_LIST_COUNT)
            .min(MAX_LIST_COUNT)
    }
}
