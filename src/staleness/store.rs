use super::generation::GenerationCounter;
use super::{DirtyRecord, StalenessStore};
use crate::error::StoreResult;
use crate::repos::{ensure_present, LIVE_REPO};
use crate::sqlite_persistence::{from_unix_opt, to_unix};
use crate::store::UpkeepDb;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// Condition on alias `d` selecting stale generation rows.
pub(crate) const STALE: &str = "d.dirty_token > d.update_token";

fn row_to_dirty_record(row: &rusqlite::Row) -> rusqlite::Result<DirtyRecord> {
    Ok(DirtyRecord {
        repository_id: row.get(0)?,
        generation: GenerationCounter::from_parts(row.get(1)?, row.get(2)?),
        set_dirty_at: from_unix_opt(3, row.get(3)?)?,
    })
}

pub(crate) fn load_record(conn: &Connection, repository_id: i64) -> StoreResult<Option<DirtyRecord>> {
    let record = conn
        .query_row(
            "SELECT repository_id, dirty_token, update_token, set_dirty_at
             FROM dirty_repositories WHERE repository_id = ?1",
            params![repository_id],
            row_to_dirty_record,
        )
        .optional()?;
    Ok(record)
}

/// Current dirty token of a repository, zero when it was never marked.
pub(crate) fn current_dirty_token(conn: &Connection, repository_id: i64) -> StoreResult<i64> {
    Ok(load_record(conn, repository_id)?
        .map(|r| r.generation.dirty_token())
        .unwrap_or(0))
}

/// Must run inside a write transaction: the read and the write below form
/// one decision.
pub(crate) fn mark_dirty(conn: &Connection, repository_id: i64, now: DateTime<Utc>) -> StoreResult<i64> {
    ensure_present(conn, repository_id)?;

    let existing = load_record(conn, repository_id)?;
    let mut generation = existing.as_ref().map(|r| r.generation).unwrap_or_default();
    let became_dirty = generation.mark_dirty();
    let set_dirty_at = if became_dirty {
        Some(now)
    } else {
        existing.and_then(|r| r.set_dirty_at)
    };

    conn.execute(
        "INSERT INTO dirty_repositories (repository_id, dirty_token, update_token, set_dirty_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (repository_id) DO UPDATE SET
            dirty_token = excluded.dirty_token,
            set_dirty_at = excluded.set_dirty_at",
        params![
            repository_id,
            generation.dirty_token(),
            generation.update_token(),
            set_dirty_at.map(to_unix),
        ],
    )?;

    debug!(
        "Marked repository {} dirty (token {}, transition {})",
        repository_id,
        generation.dirty_token(),
        became_dirty
    );
    Ok(generation.dirty_token())
}

/// Must run inside a write transaction.
pub(crate) fn consume(conn: &Connection, repository_id: i64, observed: i64) -> StoreResult<bool> {
    ensure_present(conn, repository_id)?;

    let Some(record) = load_record(conn, repository_id)? else {
        return Ok(false);
    };
    let mut generation = record.generation;
    let still_stale = generation.consume(observed);

    conn.execute(
        "UPDATE dirty_repositories SET update_token = ?2 WHERE repository_id = ?1",
        params![repository_id, generation.update_token()],
    )?;

    debug!(
        "Consumed token {} for repository {} (update token {}, still stale {})",
        observed,
        repository_id,
        generation.update_token(),
        still_stale
    );
    Ok(still_stale)
}

#[derive(Clone)]
pub struct SqliteStalenessStore {
    db: UpkeepDb,
}

impl SqliteStalenessStore {
    pub fn new(db: UpkeepDb) -> Self {
        Self { db }
    }
}

impl StalenessStore for SqliteStalenessStore {
    fn mark_dirty(&self, repository_id: i64, now: DateTime<Utc>) -> StoreResult<i64> {
        self.db.write(|tx| mark_dirty(tx, repository_id, now))
    }

    fn list_dirty(&self) -> StoreResult<HashMap<i64, i64>> {
        self.db.read(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT d.repository_id, d.dirty_token
                 FROM dirty_repositories d
                 JOIN repo r ON r.id = d.repository_id
                 WHERE {STALE} AND {LIVE_REPO}"
            ))?;
            let dirty = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<HashMap<i64, i64>>>()?;
            Ok(dirty)
        })
    }

    fn max_stale_age(&self, now: DateTime<Utc>) -> StoreResult<Duration> {
        self.db.read(|conn| {
            let oldest: Option<i64> = conn.query_row(
                &format!(
                    "SELECT MIN(d.set_dirty_at)
                     FROM dirty_repositories d
                     JOIN repo r ON r.id = d.repository_id
                     WHERE {STALE} AND {LIVE_REPO}"
                ),
                [],
                |row| row.get(0),
            )?;
            let age_secs = oldest
                .map(|set_dirty_at| to_unix(now) - set_dirty_at)
                .unwrap_or(0)
                .max(0);
            Ok(Duration::from_secs(age_secs as u64))
        })
    }

    fn consume(&self, repository_id: i64, observed_token: i64) -> StoreResult<bool> {
        self.db.write(|tx| consume(tx, repository_id, observed_token))
    }

    fn get_dirty_record(&self, repository_id: i64) -> StoreResult<Option<DirtyRecord>> {
        self.db.read(|conn| load_record(conn, repository_id))
    }
}
