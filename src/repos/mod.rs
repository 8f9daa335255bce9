//! Read access to the repository directory, plus the mirror writer that keeps
//! the local copy current.

mod directory;
mod models;

pub(crate) use directory::{ensure_present, live_project_repository_ids, LIVE_REPO};
pub use directory::SqliteRepositoryDirectory;
pub use models::Repository;

use crate::error::StoreResult;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

pub trait RepositoryDirectory: Send + Sync {
    /// Fails with `UnknownRepository` when the id is missing or soft-deleted.
    fn get(&self, id: i64) -> StoreResult<Repository>;
    fn repo_name(&self, id: i64) -> StoreResult<String>;
    /// Missing and soft-deleted ids are left out of the map.
    fn repo_names(&self, ids: &[i64]) -> StoreResult<HashMap<i64, String>>;
    fn list_project_repositories(
        &self,
        external_service_id: i64,
        project_key: &str,
    ) -> StoreResult<Vec<Repository>>;
    /// True only for live (not deleted, not blocked) repositories.
    fn has_repository(&self, id: i64) -> StoreResult<bool>;

    // Mirror writer
    fn upsert(&self, repo: &Repository) -> StoreResult<()>;
    fn soft_delete(&self, id: i64, now: DateTime<Utc>) -> StoreResult<()>;
    fn set_blocked(&self, id: i64, reason: Option<&str>) -> StoreResult<()>;
}
