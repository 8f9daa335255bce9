//! Claim-exclusive selection of repositories due for a scan.

mod selector;

pub use selector::SqliteCandidateSelector;

use crate::error::StoreResult;
use crate::policy::ScanKind;
use chrono::{DateTime, Utc};
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct ScanOptions {
    /// Minimum time between two claims of the same repository.
    pub process_delay: Duration,
    pub limit: usize,
    pub allow_global_policies: bool,
    /// Caps how many repositories a global policy contributes, most popular
    /// first. `None` means no cap.
    pub repository_match_limit: Option<usize>,
}

pub trait CandidateSelector: Send + Sync {
    /// Selects up to `options.limit` eligible repositories not claimed for
    /// `scan_kind` within `options.process_delay` of `now`, and records `now`
    /// as their claim time in the same atomic step. Retention scans also
    /// skip repositories whose derived data is stale. Ids come back ascending.
    fn select_and_claim(
        &self,
        scan_kind: ScanKind,
        options: &ScanOptions,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<i64>>;
}
