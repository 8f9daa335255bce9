//! Handle to the shared upkeep database.
//!
//! Each `UpkeepDb` owns one SQLite connection. Several handles (in one
//! process or many) may point at the same file; they coordinate only through
//! SQLite's write lock, which every deciding operation takes up front with
//! `BEGIN IMMEDIATE`.

pub mod schema;

use crate::error::{StoreError, StoreResult};
use crate::sqlite_persistence::{open_in_memory, open_versioned};
use anyhow::Result;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use schema::UPKEEP_VERSIONED_SCHEMAS;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct UpkeepDb {
    conn: Arc<Mutex<Connection>>,
}

impl UpkeepDb {
    pub fn open<P: AsRef<Path>>(db_path: P, busy_timeout: Duration) -> Result<Self> {
        let conn = open_versioned(db_path.as_ref(), UPKEEP_VERSIONED_SCHEMAS, busy_timeout)?;
        Ok(Self::from_connection(conn))
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self::from_connection(open_in_memory(
            UPKEEP_VERSIONED_SCHEMAS,
        )?))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Runs `f` inside a deferred transaction so that multi-statement reads
    /// see one consistent snapshot.
    pub fn read<T>(&self, f: impl FnOnce(&Connection) -> StoreResult<T>) -> StoreResult<T> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Runs `f` inside `BEGIN IMMEDIATE`. The write lock is held from the
    /// first read, so whatever `f` decides is committed atomically or not at
    /// all. Returning an error rolls everything back.
    pub fn write<T>(&self, f: impl FnOnce(&Transaction<'_>) -> StoreResult<T>) -> StoreResult<T> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}
