use super::models::Repository;
use super::RepositoryDirectory;
use crate::error::{StoreError, StoreResult};
use crate::sqlite_persistence::{from_unix_opt, to_unix};
use crate::store::UpkeepDb;
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::collections::HashMap;
use tracing::debug;

/// Condition on alias `r` selecting repositories that take part in maintenance.
pub(crate) const LIVE_REPO: &str = "r.deleted_at IS NULL AND r.blocked IS NULL";

const REPO_COLUMNS: &str =
    "r.id, r.name, r.project_key, r.external_service_id, r.stars, r.deleted_at, r.blocked";

fn row_to_repository(row: &rusqlite::Row) -> rusqlite::Result<Repository> {
    Ok(Repository {
        id: row.get(0)?,
        name: row.get(1)?,
        project_key: row.get(2)?,
        external_service_id: row.get(3)?,
        stars: row.get(4)?,
        deleted_at: from_unix_opt(5, row.get(5)?)?,
        blocked: row.get(6)?,
    })
}

/// Fails with `UnknownRepository` when `id` is missing or soft-deleted.
pub(crate) fn ensure_present(conn: &Connection, id: i64) -> StoreResult<()> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM repo WHERE id = ?1 AND deleted_at IS NULL)",
        params![id],
        |row| row.get(0),
    )?;
    if exists {
        Ok(())
    } else {
        Err(StoreError::UnknownRepository(id))
    }
}

pub(crate) fn is_live(conn: &Connection, id: i64) -> StoreResult<bool> {
    let exists: bool = conn.query_row(
        &format!("SELECT EXISTS(SELECT 1 FROM repo r WHERE r.id = ?1 AND {LIVE_REPO})"),
        params![id],
        |row| row.get(0),
    )?;
    Ok(exists)
}

pub(crate) fn live_project_repository_ids(
    conn: &Connection,
    external_service_id: i64,
    project_key: &str,
) -> StoreResult<Vec<i64>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT r.id FROM repo r
         WHERE r.external_service_id = ?1 AND r.project_key = ?2 AND {LIVE_REPO}
         ORDER BY r.id"
    ))?;
    let ids = stmt
        .query_map(params![external_service_id, project_key], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<i64>>>()?;
    Ok(ids)
}

#[derive(Clone)]
pub struct SqliteRepositoryDirectory {
    db: UpkeepDb,
}

impl SqliteRepositoryDirectory {
    pub fn new(db: UpkeepDb) -> Self {
        Self { db }
    }
}

impl RepositoryDirectory for SqliteRepositoryDirectory {
    fn get(&self, id: i64) -> StoreResult<Repository> {
        self.db.read(|conn| {
            conn.query_row(
                &format!("SELECT {REPO_COLUMNS} FROM repo r WHERE r.id = ?1 AND r.deleted_at IS NULL"),
                params![id],
                row_to_repository,
            )
            .optional()?
            .ok_or(StoreError::UnknownRepository(id))
        })
    }

    fn repo_name(&self, id: i64) -> StoreResult<String> {
        self.get(id).map(|repo| repo.name)
    }

    fn repo_names(&self, ids: &[i64]) -> StoreResult<HashMap<i64, String>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        self.db.read(|conn| {
            let placeholders = vec!["?"; ids.len()].join(", ");
            let mut stmt = conn.prepare(&format!(
                "SELECT r.id, r.name FROM repo r
                 WHERE r.id IN ({placeholders}) AND r.deleted_at IS NULL"
            ))?;
            let names = stmt
                .query_map(params_from_iter(ids.iter()), |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })?
                .collect::<rusqlite::Result<HashMap<i64, String>>>()?;
            Ok(names)
        })
    }

    fn list_project_repositories(
        &self,
        external_service_id: i64,
        project_key: &str,
    ) -> StoreResult<Vec<Repository>> {
        self.db.read(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {REPO_COLUMNS} FROM repo r
                 WHERE r.external_service_id = ?1 AND r.project_key = ?2 AND {LIVE_REPO}
                 ORDER BY r.id"
            ))?;
            let repos = stmt
                .query_map(params![external_service_id, project_key], row_to_repository)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(repos)
        })
    }

    fn has_repository(&self, id: i64) -> StoreResult<bool> {
        self.db.read(|conn| is_live(conn, id))
    }

    fn upsert(&self, repo: &Repository) -> StoreResult<()> {
        self.db.write(|tx| {
            tx.execute(
                "INSERT INTO repo (id, name, project_key, external_service_id, stars, deleted_at, blocked)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT (id) DO UPDATE SET
                    name = excluded.name,
                    project_key = excluded.project_key,
                    external_service_id = excluded.external_service_id,
                    stars = excluded.stars,
                    deleted_at = excluded.deleted_at,
                    blocked = excluded.blocked",
                params![
                    repo.id,
                    repo.name,
                    repo.project_key,
                    repo.external_service_id,
                    repo.stars,
                    repo.deleted_at.map(to_unix),
                    repo.blocked,
                ],
            )?;
            debug!("Upserted repository {} ({})", repo.id, repo.name);
            Ok(())
        })
    }

    fn soft_delete(&self, id: i64, now: DateTime<Utc>) -> StoreResult<()> {
        self.db.write(|tx| {
            let updated = tx.execute(
                "UPDATE repo SET deleted_at = ?2 WHERE id = ?1 AND deleted_at IS NULL",
                params![id, to_unix(now)],
            )?;
            if updated == 0 {
                return Err(StoreError::UnknownRepository(id));
            }
            Ok(())
        })
    }

    fn set_blocked(&self, id: i64, reason: Option<&str>) -> StoreResult<()> {
        self.db.write(|tx| {
            let updated = tx.execute(
                "UPDATE repo SET blocked = ?2 WHERE id = ?1 AND deleted_at IS NULL",
                params![id, reason],
            )?;
            if updated == 0 {
                return Err(StoreError::UnknownRepository(id));
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory() -> SqliteRepositoryDirectory {
        SqliteRepositoryDirectory::new(UpkeepDb::in_memory().unwrap())
    }

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn test_get_and_names() {
        let dir = directory();
        dir.upsert(&Repository::new(1, "github.com/a/one")).unwrap();
        dir.upsert(&Repository::new(2, "github.com/a/two")).unwrap();

        assert_eq!(dir.get(1).unwrap().name, "github.com/a/one");
        assert_eq!(dir.repo_name(2).unwrap(), "github.com/a/two");

        let names = dir.repo_names(&[1, 2, 99]).unwrap();
        assert_eq!(names.len(), 2);
        assert_eq!(names[&1], "github.com/a/one");
        assert!(!names.contains_key(&99));
    }

    #[test]
    fn test_unknown_and_deleted_repositories() {
        let dir = directory();
        dir.upsert(&Repository::new(1, "a")).unwrap();
        dir.soft_delete(1, ts(100)).unwrap();

        assert!(matches!(dir.get(1), Err(StoreError::UnknownRepository(1))));
        assert!(matches!(dir.get(2), Err(StoreError::UnknownRepository(2))));
        assert!(!dir.has_repository(1).unwrap());
        assert!(dir.repo_names(&[1]).unwrap().is_empty());
        assert!(matches!(
            dir.soft_delete(1, ts(200)),
            Err(StoreError::UnknownRepository(1))
        ));
    }

    #[test]
    fn test_blocked_repository_is_visible_but_not_live() {
        let dir = directory();
        dir.upsert(&Repository::new(1, "a")).unwrap();
        dir.set_blocked(1, Some("legal hold")).unwrap();

        let repo = dir.get(1).unwrap();
        assert_eq!(repo.blocked.as_deref(), Some("legal hold"));
        assert!(!repo.is_live());
        assert!(!dir.has_repository(1).unwrap());

        dir.set_blocked(1, None).unwrap();
        assert!(dir.has_repository(1).unwrap());
    }

    #[test]
    fn test_list_project_repositories_skips_other_projects_and_dead_repos() {
        let dir = directory();
        dir.upsert(&Repository::new(1, "a").in_project(5, "PROJ")).unwrap();
        dir.upsert(&Repository::new(2, "b").in_project(5, "PROJ")).unwrap();
        dir.upsert(&Repository::new(3, "c").in_project(5, "OTHER")).unwrap();
        dir.upsert(&Repository::new(4, "d").in_project(6, "PROJ")).unwrap();
        dir.upsert(&Repository::new(5, "e").in_project(5, "PROJ")).unwrap();
        dir.soft_delete(5, ts(10)).unwrap();

        let ids: Vec<i64> = dir
            .list_project_repositories(5, "PROJ")
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec![1, 2]);
    }
}
