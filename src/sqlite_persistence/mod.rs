//! Shared SQLite plumbing: declarative versioned schemas, database opening
//! with validation and migration, and timestamp conversions.

mod versioned_schema;

pub use versioned_schema::*;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{types::Type, Connection};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Opens (or creates) the database at `path` and brings it to the newest
/// version in `schemas`.
///
/// A fresh file is created directly at the newest version. An existing file
/// is validated against the schema for its recorded version and then migrated
/// forward inside a single transaction.
pub fn open_versioned(
    path: &Path,
    schemas: &[VersionedSchema],
    busy_timeout: Duration,
) -> Result<Connection> {
    let latest = schemas.last().context("No schema versions declared")?;
    let is_new_db = !path.exists();

    let mut conn = Connection::open(path)
        .with_context(|| format!("Failed to open database at {:?}", path))?;
    configure_connection(&conn, busy_timeout)?;
    // WAL lets readers proceed while another instance holds the write lock
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
        .context("Failed to enable WAL journal mode")?;

    if is_new_db {
        info!("Creating new database at {:?}", path);
        latest.create(&conn)?;
        return Ok(conn);
    }

    let raw_version: i64 = conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;
    if raw_version == 0 {
        // Created by another instance that has not committed its schema yet,
        // or an empty file: treat as fresh.
        let has_tables: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table')",
            [],
            |row| row.get(0),
        )?;
        if !has_tables {
            info!("Initializing empty database at {:?}", path);
            latest.create(&conn)?;
            return Ok(conn);
        }
    }

    let db_version = raw_version - BASE_DB_VERSION as i64;
    if db_version < 1 {
        bail!(
            "Database version {} is invalid (expected >= 1)",
            db_version
        );
    }
    if db_version > latest.version as i64 {
        bail!(
            "Database version {} is newer than the newest known version {}",
            db_version,
            latest.version
        );
    }

    let schema = schemas
        .iter()
        .find(|s| s.version == db_version as usize)
        .with_context(|| format!("Unknown database version {}", db_version))?;
    schema.validate(&conn).with_context(|| {
        format!(
            "Database schema validation failed for version {}",
            db_version
        )
    })?;

    if (db_version as usize) < latest.version {
        info!(
            "Migrating database from version {} to {}",
            db_version, latest.version
        );
        migrate(&mut conn, schemas, db_version as usize)?;
    }

    Ok(conn)
}

/// Creates a private in-memory database at the newest schema version.
pub fn open_in_memory(schemas: &[VersionedSchema]) -> Result<Connection> {
    let latest = schemas.last().context("No schema versions declared")?;
    let conn = Connection::open_in_memory()?;
    configure_connection(&conn, Duration::ZERO)?;
    latest.create(&conn)?;
    Ok(conn)
}

fn configure_connection(conn: &Connection, busy_timeout: Duration) -> Result<()> {
    conn.execute("PRAGMA foreign_keys = ON;", [])?;
    conn.busy_timeout(busy_timeout)?;
    Ok(())
}

fn migrate(conn: &mut Connection, schemas: &[VersionedSchema], from_version: usize) -> Result<()> {
    let tx = conn.transaction()?;
    let mut latest_from = from_version;
    for schema in schemas.iter().filter(|s| s.version > from_version) {
        info!(
            "Running database migration from version {} to {}",
            latest_from, schema.version
        );
        if let Some(migration_fn) = schema.migration {
            migration_fn(&tx).with_context(|| {
                format!("Failed to run migration to version {}", schema.version)
            })?;
        }
        latest_from = schema.version;
    }
    tx.execute(
        &format!("PRAGMA user_version = {}", BASE_DB_VERSION + latest_from),
        [],
    )?;
    tx.commit()?;
    Ok(())
}

pub fn to_unix(dt: DateTime<Utc>) -> i64 {
    dt.timestamp()
}

/// Reads a stored Unix timestamp back, reporting out-of-range values as a
/// conversion failure on column `idx`.
pub fn from_unix(idx: usize, secs: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Integer,
            format!("timestamp {} out of range", secs).into(),
        )
    })
}

pub fn from_unix_opt(idx: usize, secs: Option<i64>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    secs.map(|s| from_unix(idx, s)).transpose()
}
