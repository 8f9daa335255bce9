use super::models::{ConfigurationPolicy, NewPolicy, PolicyScope, ScanKind};
use super::patterns::compile_patterns;
use super::PolicyEngine;
use crate::error::{StoreError, StoreResult};
use crate::repos::{ensure_present, LIVE_REPO};
use crate::store::UpkeepDb;
use rusqlite::types::Type;
use rusqlite::{named_params, params, Connection, OptionalExtension};
use tracing::{debug, info};

/// Common table expressions computing the eligible set for one scan kind.
///
/// Defines `global_matches`, `policy_matches` and `eligible(repository_id)`.
/// Binds `:scan_kind`, `:allow_global` (0/1) and `:match_limit` (-1 for no cap).
/// A global policy contributes only when both the caller and the policy
/// allow it; anything else about it is ignored, so a misconfigured policy
/// yields nothing rather than an error.
pub(crate) const ELIGIBLE_CTES: &str = "
    global_matches AS (
        SELECT r.id AS repository_id
        FROM repo r
        WHERE :allow_global = 1
          AND r.deleted_at IS NULL AND r.blocked IS NULL
          AND EXISTS (
              SELECT 1 FROM configuration_policies p
              WHERE p.scan_kind = :scan_kind
                AND p.enabled = 1
                AND p.scope = 'global'
                AND p.allow_global = 1
          )
        ORDER BY r.stars DESC NULLS LAST, r.id
        LIMIT :match_limit
    ),
    policy_matches AS (
        SELECT p.repository_id
        FROM configuration_policies p
        WHERE p.scan_kind = :scan_kind AND p.enabled = 1 AND p.scope = 'repository'
        UNION
        SELECT m.repository_id
        FROM policy_repository_matches m
        JOIN configuration_policies p ON p.id = m.policy_id
        WHERE p.scan_kind = :scan_kind AND p.enabled = 1 AND p.scope = 'patterns'
    ),
    eligible AS (
        SELECT r.id AS repository_id
        FROM repo r
        WHERE r.deleted_at IS NULL AND r.blocked IS NULL
          AND r.id IN (
              SELECT repository_id FROM global_matches
              UNION
              SELECT repository_id FROM policy_matches
          )
    )";

pub(crate) fn match_limit_param(repository_match_limit: Option<usize>) -> i64 {
    repository_match_limit.map(|l| l as i64).unwrap_or(-1)
}

const POLICY_COLUMNS: &str =
    "id, name, scan_kind, enabled, scope, repository_id, repository_patterns, allow_global";

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

fn row_to_policy(row: &rusqlite::Row) -> rusqlite::Result<ConfigurationPolicy> {
    let scan_kind_str: String = row.get(2)?;
    let scan_kind = ScanKind::parse(&scan_kind_str)
        .ok_or_else(|| conversion_error(2, format!("unknown scan kind '{}'", scan_kind_str)))?;

    let scope_str: String = row.get(4)?;
    let scope = match scope_str.as_str() {
        "global" => PolicyScope::Global,
        "repository" => {
            let repository_id: Option<i64> = row.get(5)?;
            PolicyScope::Repository(repository_id.ok_or_else(|| {
                conversion_error(5, "repository policy without repository_id".to_string())
            })?)
        }
        "patterns" => {
            let raw: Option<String> = row.get(6)?;
            let patterns = match raw {
                Some(json) => serde_json::from_str(&json)
                    .map_err(|e| conversion_error(6, format!("bad pattern list: {}", e)))?,
                None => Vec::new(),
            };
            PolicyScope::Patterns(patterns)
        }
        other => return Err(conversion_error(4, format!("unknown scope '{}'", other))),
    };

    Ok(ConfigurationPolicy {
        id: row.get(0)?,
        name: row.get(1)?,
        scan_kind,
        enabled: row.get(3)?,
        scope,
        allow_global: row.get(7)?,
    })
}

fn load_policy(conn: &Connection, policy_id: i64) -> StoreResult<ConfigurationPolicy> {
    conn.query_row(
        &format!("SELECT {POLICY_COLUMNS} FROM configuration_policies WHERE id = ?1"),
        params![policy_id],
        row_to_policy,
    )
    .optional()?
    .ok_or(StoreError::UnknownPolicy(policy_id))
}

/// Replaces the precomputed membership of one policy. Non-pattern policies
/// end up with no rows.
fn refresh_matches(conn: &Connection, policy: &ConfigurationPolicy) -> StoreResult<usize> {
    conn.execute(
        "DELETE FROM policy_repository_matches WHERE policy_id = ?1",
        params![policy.id],
    )?;

    let PolicyScope::Patterns(patterns) = &policy.scope else {
        return Ok(0);
    };
    let Some(matcher) = compile_patterns(patterns)? else {
        return Ok(0);
    };

    let mut select = conn.prepare(&format!("SELECT r.id, r.name FROM repo r WHERE {LIVE_REPO}"))?;
    let candidates = select
        .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut insert = conn.prepare(
        "INSERT INTO policy_repository_matches (policy_id, repository_id) VALUES (?1, ?2)",
    )?;
    let mut matched = 0;
    for (repository_id, name) in candidates {
        if matcher.is_match(&name) {
            insert.execute(params![policy.id, repository_id])?;
            matched += 1;
        }
    }
    debug!("Policy {} matches {} repositories", policy.id, matched);
    Ok(matched)
}

#[derive(Clone)]
pub struct SqlitePolicyEngine {
    db: UpkeepDb,
}

impl SqlitePolicyEngine {
    pub fn new(db: UpkeepDb) -> Self {
        Self { db }
    }
}

impl PolicyEngine for SqlitePolicyEngine {
    fn create_policy(&self, policy: NewPolicy) -> StoreResult<ConfigurationPolicy> {
        self.db.write(|tx| {
            let (repository_id, patterns_json) = match &policy.scope {
                PolicyScope::Global => (None, None),
                PolicyScope::Repository(id) => {
                    ensure_present(tx, *id)?;
                    (Some(*id), None)
                }
                PolicyScope::Patterns(patterns) => (None, Some(serde_json::to_string(patterns)?)),
            };

            tx.execute(
                "INSERT INTO configuration_policies
                    (name, scan_kind, enabled, scope, repository_id, repository_patterns, allow_global)
                 VALUES (?1, ?2, 1, ?3, ?4, ?5, ?6)",
                params![
                    policy.name,
                    policy.scan_kind.as_str(),
                    policy.scope.kind_str(),
                    repository_id,
                    patterns_json,
                    policy.allow_global,
                ],
            )?;
            let created = load_policy(tx, tx.last_insert_rowid())?;
            refresh_matches(tx, &created)?;
            info!(
                "Created {} policy {} '{}' ({})",
                created.scan_kind,
                created.id,
                created.name,
                created.scope.kind_str()
            );
            Ok(created)
        })
    }

    fn set_enabled(&self, policy_id: i64, enabled: bool) -> StoreResult<()> {
        self.db.write(|tx| {
            let updated = tx.execute(
                "UPDATE configuration_policies SET enabled = ?2 WHERE id = ?1",
                params![policy_id, enabled],
            )?;
            if updated == 0 {
                return Err(StoreError::UnknownPolicy(policy_id));
            }
            Ok(())
        })
    }

    fn get_policy(&self, policy_id: i64) -> StoreResult<ConfigurationPolicy> {
        self.db.read(|conn| load_policy(conn, policy_id))
    }

    fn list_policies(&self, scan_kind: Option<ScanKind>) -> StoreResult<Vec<ConfigurationPolicy>> {
        self.db.read(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {POLICY_COLUMNS} FROM configuration_policies
                 WHERE ?1 IS NULL OR scan_kind = ?1
                 ORDER BY id"
            ))?;
            let policies = stmt
                .query_map(params![scan_kind.map(|k| k.as_str())], row_to_policy)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(policies)
        })
    }

    fn eligible_repositories(
        &self,
        scan_kind: ScanKind,
        allow_global_policies: bool,
        repository_match_limit: Option<usize>,
    ) -> StoreResult<Vec<i64>> {
        self.db.read(|conn| {
            let mut stmt = conn.prepare(&format!(
                "WITH {ELIGIBLE_CTES}
                 SELECT repository_id FROM eligible ORDER BY repository_id"
            ))?;
            let ids = stmt
                .query_map(
                    named_params! {
                        ":scan_kind": scan_kind.as_str(),
                        ":allow_global": allow_global_policies,
                        ":match_limit": match_limit_param(repository_match_limit),
                    },
                    |row| row.get(0),
                )?
                .collect::<rusqlite::Result<Vec<i64>>>()?;
            Ok(ids)
        })
    }

    fn refresh_pattern_matches(&self, policy_id: i64) -> StoreResult<usize> {
        self.db.write(|tx| {
            let policy = load_policy(tx, policy_id)?;
            refresh_matches(tx, &policy)
        })
    }

    fn refresh_all_pattern_matches(&self) -> StoreResult<usize> {
        self.db.write(|tx| {
            let mut stmt = tx.prepare(&format!(
                "SELECT {POLICY_COLUMNS} FROM configuration_policies WHERE scope = 'patterns'"
            ))?;
            let policies = stmt
                .query_map([], row_to_policy)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            let mut total = 0;
            for policy in &policies {
                total += refresh_matches(tx, policy)?;
            }
            Ok(total)
        })
    }
}
