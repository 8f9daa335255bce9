//! Per-repository staleness ledger built on [`GenerationCounter`].

mod generation;
mod store;

pub use generation::GenerationCounter;
pub(crate) use store::{consume, current_dirty_token, mark_dirty, STALE};
pub use store::SqliteStalenessStore;

use crate::error::StoreResult;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirtyRecord {
    pub repository_id: i64,
    pub generation: GenerationCounter,
    /// When the repository last went from clean to stale.
    pub set_dirty_at: Option<DateTime<Utc>>,
}

impl DirtyRecord {
    pub fn is_stale(&self) -> bool {
        self.generation.is_stale()
    }
}

pub trait StalenessStore: Send + Sync {
    /// Produces a new generation for the repository and returns its token.
    fn mark_dirty(&self, repository_id: i64, now: DateTime<Utc>) -> StoreResult<i64>;

    /// Repository id to dirty token, for live stale repositories.
    fn list_dirty(&self) -> StoreResult<HashMap<i64, i64>>;

    /// Age of the oldest live stale repository, zero when nothing is stale.
    fn max_stale_age(&self, now: DateTime<Utc>) -> StoreResult<Duration>;

    /// Records a finished recomputation that started at `observed_token`.
    /// Returns whether the repository is still stale.
    fn consume(&self, repository_id: i64, observed_token: i64) -> StoreResult<bool>;

    fn get_dirty_record(&self, repository_id: i64) -> StoreResult<Option<DirtyRecord>>;
}
