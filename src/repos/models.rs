use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A repository as mirrored from the external directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    pub id: i64,
    pub name: String,
    /// Bitbucket project the repository belongs to, if any.
    pub project_key: Option<String>,
    pub external_service_id: Option<i64>,
    /// Popularity metric used to rank globally matched repositories.
    pub stars: Option<i64>,
    pub deleted_at: Option<DateTime<Utc>>,
    /// Block reason; a blocked repository is excluded from all maintenance.
    pub blocked: Option<String>,
}

impl Repository {
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            project_key: None,
            external_service_id: None,
            stars: None,
            deleted_at: None,
            blocked: None,
        }
    }

    pub fn in_project(mut self, external_service_id: i64, project_key: impl Into<String>) -> Self {
        self.external_service_id = Some(external_service_id);
        self.project_key = Some(project_key.into());
        self
    }

    pub fn with_stars(mut self, stars: i64) -> Self {
        self.stars = Some(stars);
        self
    }

    /// Neither soft-deleted nor blocked.
    pub fn is_live(&self) -> bool {
        self.deleted_at.is_none() && self.blocked.is_none()
    }
}
