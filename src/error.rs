use thiserror::Error;

/// Failures surfaced by the persisted store and the operations built on it.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unknown repository {0}")]
    UnknownRepository(i64),

    #[error("unknown permission sync job {0}")]
    UnknownJob(i64),

    #[error("unknown sync request {0}")]
    UnknownRequest(i64),

    #[error("unknown configuration policy {0}")]
    UnknownPolicy(i64),

    #[error("unknown project {project_key} on external service {external_service_id}")]
    UnknownProject {
        project_key: String,
        external_service_id: i64,
    },

    #[error("cannot {action} {job_id} in state {state}")]
    InvalidTransition {
        job_id: i64,
        state: String,
        action: &'static str,
    },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("connection lock poisoned")]
    Poisoned,
}

pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    /// True for transient store unavailability (another instance holds the
    /// write lock past the busy timeout). The whole operation may be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Database(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    pub fn is_unknown_resource(&self) -> bool {
        matches!(
            self,
            StoreError::UnknownRepository(_)
                | StoreError::UnknownJob(_)
                | StoreError::UnknownPolicy(_)
                | StoreError::UnknownRequest(_)
                | StoreError::UnknownProject { .. }
        )
    }
}
