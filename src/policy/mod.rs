//! Configuration policies and the eligibility rules derived from them.

mod engine;
mod models;
mod patterns;

pub(crate) use engine::{match_limit_param, ELIGIBLE_CTES};
pub use engine::SqlitePolicyEngine;
pub use models::{ConfigurationPolicy, NewPolicy, PolicyScope, ScanKind};
pub use patterns::compile_patterns;

use crate::error::StoreResult;

pub trait PolicyEngine: Send + Sync {
    /// Creates an enabled policy. Pattern policies get their membership
    /// computed in the same transaction.
    fn create_policy(&self, policy: NewPolicy) -> StoreResult<ConfigurationPolicy>;
    fn set_enabled(&self, policy_id: i64, enabled: bool) -> StoreResult<()>;
    fn get_policy(&self, policy_id: i64) -> StoreResult<ConfigurationPolicy>;
    fn list_policies(&self, scan_kind: Option<ScanKind>) -> StoreResult<Vec<ConfigurationPolicy>>;

    /// Live repositories eligible for `scan_kind`, ascending by id. Nothing
    /// is claimed.
    fn eligible_repositories(
        &self,
        scan_kind: ScanKind,
        allow_global_policies: bool,
        repository_match_limit: Option<usize>,
    ) -> StoreResult<Vec<i64>>;

    /// Recomputes one pattern policy's membership. Returns the match count.
    fn refresh_pattern_matches(&self, policy_id: i64) -> StoreResult<usize>;
    fn refresh_all_pattern_matches(&self) -> StoreResult<usize>;
}
