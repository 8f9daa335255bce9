use super::{CandidateSelector, ScanOptions};
use crate::error::StoreResult;
use crate::metrics;
use crate::policy::{match_limit_param, ScanKind, ELIGIBLE_CTES};
use crate::sqlite_persistence::to_unix;
use crate::staleness::STALE;
use crate::store::UpkeepDb;
use chrono::{DateTime, Utc};
use rusqlite::{named_params, Connection};
use tracing::debug;

/// Picks and claims candidates in one statement.
///
/// The ledger upsert and the choice of rows are the same statement, run
/// under the database write lock, so two callers with the same `now` can
/// never both receive a repository.
fn claim_sql() -> String {
    format!(
        "WITH {ELIGIBLE_CTES},
        candidates AS (
            SELECT e.repository_id, l.last_scan_at
            FROM eligible e
            LEFT JOIN scan_ledger l
                ON l.repository_id = e.repository_id AND l.scan_kind = :scan_kind
            WHERE (l.last_scan_at IS NULL OR :now - l.last_scan_at > :process_delay)
              AND (:require_fresh = 0 OR NOT EXISTS (
                  SELECT 1 FROM dirty_repositories d
                  WHERE d.repository_id = e.repository_id AND {STALE}
              ))
            ORDER BY l.last_scan_at ASC NULLS FIRST, e.repository_id
            LIMIT :limit
        )
        INSERT INTO scan_ledger (repository_id, scan_kind, last_scan_at)
        SELECT repository_id, :scan_kind, :now FROM candidates WHERE true
        ON CONFLICT (repository_id, scan_kind) DO UPDATE SET last_scan_at = excluded.last_scan_at
        RETURNING repository_id"
    )
}

/// Claims candidates on `conn`, which must be inside a write transaction.
pub(crate) fn select_and_claim(
    conn: &Connection,
    scan_kind: ScanKind,
    options: &ScanOptions,
    now: DateTime<Utc>,
) -> StoreResult<Vec<i64>> {
    if options.limit == 0 {
        return Ok(Vec::new());
    }
    let mut stmt = conn.prepare(&claim_sql())?;
    let mut claimed = stmt
        .query_map(
            named_params! {
                ":scan_kind": scan_kind.as_str(),
                ":allow_global": options.allow_global_policies,
                ":match_limit": match_limit_param(options.repository_match_limit),
                ":now": to_unix(now),
                ":process_delay": options.process_delay.as_secs() as i64,
                ":require_fresh": scan_kind == ScanKind::Retention,
                ":limit": options.limit as i64,
            },
            |row| row.get::<_, i64>(0),
        )?
        .collect::<rusqlite::Result<Vec<i64>>>()?;
    claimed.sort_unstable();
    Ok(claimed)
}

#[derive(Clone)]
pub struct SqliteCandidateSelector {
    db: UpkeepDb,
}

impl SqliteCandidateSelector {
    pub fn new(db: UpkeepDb) -> Self {
        Self { db }
    }
}

impl CandidateSelector for SqliteCandidateSelector {
    fn select_and_claim(
        &self,
        scan_kind: ScanKind,
        options: &ScanOptions,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<i64>> {
        let claimed = self
            .db
            .write(|tx| select_and_claim(tx, scan_kind, options, now))?;
        debug!(
            "Claimed {} repositories for {} scan at {}",
            claimed.len(),
            scan_kind,
            now
        );
        metrics::record_scan_claims(scan_kind.as_str(), claimed.len());
        Ok(claimed)
    }
}
