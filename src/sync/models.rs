use crate::permission_jobs::UserPermission;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    Accepted,
    AlreadyPending,
}

/// What an immediate sync request is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "id")]
pub enum SyncTarget {
    Repository(i64),
    User(i64),
}

impl SyncTarget {
    pub(crate) fn kind_str(&self) -> &'static str {
        match self {
            SyncTarget::Repository(_) => "repository",
            SyncTarget::User(_) => "user",
        }
    }

    pub(crate) fn id(&self) -> i64 {
        match self {
            SyncTarget::Repository(id) | SyncTarget::User(id) => *id,
        }
    }

    pub(crate) fn from_parts(kind: &str, id: i64) -> Option<Self> {
        match kind {
            "repository" => Some(SyncTarget::Repository(id)),
            "user" => Some(SyncTarget::User(id)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl RequestState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestState::Pending => "pending",
            RequestState::Processing => "processing",
            RequestState::Completed => "completed",
            RequestState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RequestState::Pending),
            "processing" => Some(RequestState::Processing),
            "completed" => Some(RequestState::Completed),
            "failed" => Some(RequestState::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub id: i64,
    pub target: SyncTarget,
    pub invalidate_caches: bool,
    pub state: RequestState,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Dirty token of the repository when the request was claimed.
    pub observed_token: Option<i64>,
    pub failure_message: Option<String>,
}

/// Explicit permissions stored for one repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryPermissions {
    pub repository_id: i64,
    pub unrestricted: bool,
    pub updated_at: DateTime<Utc>,
    pub source_job_id: Option<i64>,
    pub permissions: Vec<UserPermission>,
}
