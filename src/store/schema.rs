//! SQLite schema definitions for the upkeep database.
//!
//! Every table lives in one file so that cross-table writes (project
//! permissions plus their bookkeeping job) commit together.

use crate::sqlite_column;
use crate::sqlite_persistence::{
    Column, ForeignKey, ForeignKeyOnChange, SqlType, Table, VersionedSchema,
};

const REPO_FK: ForeignKey = ForeignKey {
    foreign_table: "repo",
    foreign_column: "id",
    on_delete: ForeignKeyOnChange::Cascade,
};

// =============================================================================
// Version 1
// =============================================================================

/// Mirror of the external repository directory.
const REPO_TABLE_V1: Table = Table {
    name: "repo",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("name", &SqlType::Text, non_null = true),
        sqlite_column!("project_key", &SqlType::Text),
        sqlite_column!("external_service_id", &SqlType::Integer),
        sqlite_column!("stars", &SqlType::Integer),
        sqlite_column!("deleted_at", &SqlType::Integer),
        sqlite_column!("blocked", &SqlType::Text),
    ],
    indices: &[("idx_repo_project", "external_service_id, project_key")],
    unique_constraints: &[&["name"]],
};

/// Generation counters, one row per repository that was ever marked dirty.
const DIRTY_REPOSITORIES_TABLE_V1: Table = Table {
    name: "dirty_repositories",
    columns: &[
        sqlite_column!(
            "repository_id",
            &SqlType::Integer,
            is_primary_key = true,
            foreign_key = Some(&REPO_FK)
        ),
        sqlite_column!(
            "dirty_token",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!(
            "update_token",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!("set_dirty_at", &SqlType::Integer),
    ],
    indices: &[],
    unique_constraints: &[],
};

/// Last claim time per repository per scan kind.
const SCAN_LEDGER_TABLE_V1: Table = Table {
    name: "scan_ledger",
    columns: &[
        sqlite_column!(
            "repository_id",
            &SqlType::Integer,
            non_null = true,
            foreign_key = Some(&REPO_FK)
        ),
        sqlite_column!("scan_kind", &SqlType::Text, non_null = true),
        sqlite_column!("last_scan_at", &SqlType::Integer, non_null = true),
    ],
    indices: &[("idx_scan_ledger_kind_time", "scan_kind, last_scan_at")],
    unique_constraints: &[&["repository_id", "scan_kind"]],
};

const CONFIGURATION_POLICIES_TABLE_V1: Table = Table {
    name: "configuration_policies",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("name", &SqlType::Text, non_null = true),
        sqlite_column!("scan_kind", &SqlType::Text, non_null = true),
        sqlite_column!(
            "enabled",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("1")
        ),
        sqlite_column!("scope", &SqlType::Text, non_null = true),
        sqlite_column!(
            "repository_id",
            &SqlType::Integer,
            foreign_key = Some(&REPO_FK)
        ),
        sqlite_column!("repository_patterns", &SqlType::Text),
        sqlite_column!(
            "allow_global",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
    ],
    indices: &[("idx_policies_scan_kind", "scan_kind, enabled")],
    unique_constraints: &[],
};

/// Precomputed membership of pattern-set policies.
const POLICY_REPOSITORY_MATCHES_TABLE_V1: Table = Table {
    name: "policy_repository_matches",
    columns: &[
        sqlite_column!(
            "policy_id",
            &SqlType::Integer,
            non_null = true,
            foreign_key = Some(&ForeignKey {
                foreign_table: "configuration_policies",
                foreign_column: "id",
                on_delete: ForeignKeyOnChange::Cascade,
            })
        ),
        sqlite_column!(
            "repository_id",
            &SqlType::Integer,
            non_null = true,
            foreign_key = Some(&REPO_FK)
        ),
    ],
    indices: &[("idx_policy_matches_repo", "repository_id")],
    unique_constraints: &[&["policy_id", "repository_id"]],
};

const PERMISSION_SYNC_JOBS_TABLE_V1: Table = Table {
    name: "permission_sync_jobs",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("state", &SqlType::Text, non_null = true),
        sqlite_column!("failure_message", &SqlType::Text),
        sqlite_column!("queued_at", &SqlType::Integer, non_null = true),
        sqlite_column!("started_at", &SqlType::Integer),
        sqlite_column!("finished_at", &SqlType::Integer),
        sqlite_column!("process_after", &SqlType::Integer),
        sqlite_column!(
            "num_resets",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!(
            "num_failures",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!("project_key", &SqlType::Text, non_null = true),
        sqlite_column!("external_service_id", &SqlType::Integer, non_null = true),
        sqlite_column!("permissions", &SqlType::Text, non_null = true),
        sqlite_column!(
            "unrestricted",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        // Bumped by every lease; reports must name the lease they hold
        sqlite_column!(
            "lease_id",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
    ],
    indices: &[
        ("idx_permission_jobs_state_queued", "state, queued_at"),
        ("idx_permission_jobs_project", "project_key"),
    ],
    unique_constraints: &[],
};

/// Explicit per-repository user permissions written for a project.
const REPO_PERMISSIONS_TABLE_V1: Table = Table {
    name: "repo_permissions",
    columns: &[
        sqlite_column!(
            "repository_id",
            &SqlType::Integer,
            non_null = true,
            foreign_key = Some(&REPO_FK)
        ),
        sqlite_column!("bind_id", &SqlType::Text, non_null = true),
        sqlite_column!("permission", &SqlType::Text, non_null = true),
    ],
    indices: &[],
    unique_constraints: &[&["repository_id", "bind_id"]],
};

const REPO_PERMISSION_SETS_TABLE_V1: Table = Table {
    name: "repo_permission_sets",
    columns: &[
        sqlite_column!(
            "repository_id",
            &SqlType::Integer,
            is_primary_key = true,
            foreign_key = Some(&REPO_FK)
        ),
        sqlite_column!("unrestricted", &SqlType::Integer, non_null = true),
        sqlite_column!("updated_at", &SqlType::Integer, non_null = true),
        sqlite_column!(
            "source_job_id",
            &SqlType::Integer,
            foreign_key = Some(&ForeignKey {
                foreign_table: "permission_sync_jobs",
                foreign_column: "id",
                on_delete: ForeignKeyOnChange::SetNull,
            })
        ),
    ],
    indices: &[],
    unique_constraints: &[],
};

/// Immediate per-target sync requests (repository or user).
const PERMISSION_SYNC_REQUESTS_TABLE_V1: Table = Table {
    name: "permission_sync_requests",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("target_kind", &SqlType::Text, non_null = true),
        sqlite_column!("target_id", &SqlType::Integer, non_null = true),
        sqlite_column!(
            "invalidate_caches",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!("state", &SqlType::Text, non_null = true),
        sqlite_column!("queued_at", &SqlType::Integer, non_null = true),
        sqlite_column!("started_at", &SqlType::Integer),
        sqlite_column!("finished_at", &SqlType::Integer),
        sqlite_column!("observed_token", &SqlType::Integer),
        sqlite_column!("failure_message", &SqlType::Text),
    ],
    indices: &[
        ("idx_sync_requests_target", "target_kind, target_id, state"),
        ("idx_sync_requests_state_queued", "state, queued_at"),
    ],
    unique_constraints: &[],
};

pub const UPKEEP_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 1,
    tables: &[
        REPO_TABLE_V1,
        DIRTY_REPOSITORIES_TABLE_V1,
        SCAN_LEDGER_TABLE_V1,
        CONFIGURATION_POLICIES_TABLE_V1,
        POLICY_REPOSITORY_MATCHES_TABLE_V1,
        PERMISSION_SYNC_JOBS_TABLE_V1,
        REPO_PERMISSIONS_TABLE_V1,
        REPO_PERMISSION_SETS_TABLE_V1,
        PERMISSION_SYNC_REQUESTS_TABLE_V1,
    ],
    migration: None,
}];

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_latest_schema_creates_and_validates() {
        let conn = Connection::open_in_memory().unwrap();
        let schema = UPKEEP_VERSIONED_SCHEMAS.last().unwrap();
        schema.create(&conn).unwrap();
        schema.validate(&conn).unwrap();
    }

    #[test]
    fn test_scan_ledger_rejects_duplicate_claim_rows() {
        let conn = Connection::open_in_memory().unwrap();
        UPKEEP_VERSIONED_SCHEMAS.last().unwrap().create(&conn).unwrap();
        conn.execute("INSERT INTO repo (id, name) VALUES (1, 'a')", [])
            .unwrap();
        conn.execute(
            "INSERT INTO scan_ledger (repository_id, scan_kind, last_scan_at) VALUES (1, 'indexing', 10)",
            [],
        )
        .unwrap();
        let dup = conn.execute(
            "INSERT INTO scan_ledger (repository_id, scan_kind, last_scan_at) VALUES (1, 'indexing', 20)",
            [],
        );
        assert!(dup.is_err());
        conn.execute(
            "INSERT INTO scan_ledger (repository_id, scan_kind, last_scan_at) VALUES (1, 'retention', 20)",
            [],
        )
        .unwrap();
    }
}
