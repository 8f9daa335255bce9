//! Database fixtures shared by the end-to-end tests.

#![allow(dead_code)]

use super::constants::*;
use chrono::{DateTime, Utc};
use repo_upkeep::permission_jobs::{RetryPolicy, SqliteJobQueue};
use repo_upkeep::policy::{NewPolicy, PolicyEngine, PolicyScope, ScanKind, SqlitePolicyEngine};
use repo_upkeep::repos::{Repository, RepositoryDirectory, SqliteRepositoryDirectory};
use repo_upkeep::store::UpkeepDb;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub fn ts(offset_secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(T0 + offset_secs, 0).unwrap()
}

/// Two independent handles on one database file, as two instances would
/// have.
pub struct SharedDb {
    pub first: UpkeepDb,
    pub second: UpkeepDb,
    _dir: TempDir,
}

impl SharedDb {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("upkeep.db");
        let first = UpkeepDb::open(&path, Duration::from_secs(10)).unwrap();
        let second = UpkeepDb::open(&path, Duration::from_secs(10)).unwrap();
        Self {
            first,
            second,
            _dir: dir,
        }
    }
}

/// Live repositories named `{prefix}/repo-{id}`, all in the test project.
pub fn seed_repositories(db: &UpkeepDb, ids: RangeInclusive<i64>, prefix: &str) {
    let directory = SqliteRepositoryDirectory::new(db.clone());
    for id in ids {
        directory
            .upsert(
                &Repository::new(id, format!("{}/repo-{}", prefix, id))
                    .in_project(EXTERNAL_SERVICE_ID, PROJECT_KEY)
                    .with_stars(id),
            )
            .unwrap();
    }
}

/// Enabled pattern policy covering `{prefix}/*`.
pub fn seed_pattern_policy(db: &UpkeepDb, scan_kind: ScanKind, prefix: &str) -> i64 {
    SqlitePolicyEngine::new(db.clone())
        .create_policy(NewPolicy::new(
            format!("{} {}", scan_kind, prefix),
            scan_kind,
            PolicyScope::Patterns(vec![format!("{}/*", prefix)]),
        ))
        .unwrap()
        .id
}

pub fn job_queue(db: &UpkeepDb) -> Arc<SqliteJobQueue> {
    Arc::new(SqliteJobQueue::new(
        db.clone(),
        RetryPolicy::default(),
        Duration::from_secs(600),
    ))
}
