use super::models::{RequestState, SyncOutcome, SyncRequest, SyncTarget};
use super::{StalledRequests, SyncRequestQueue};
use crate::error::{StoreError, StoreResult};
use crate::sqlite_persistence::{from_unix, from_unix_opt, to_unix};
use crate::staleness;
use crate::store::UpkeepDb;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use std::time::Duration;
use tracing::{debug, warn};

const REQUEST_COLUMNS: &str = "id, target_kind, target_id, invalidate_caches, state, queued_at, \
     started_at, finished_at, observed_token, failure_message";

fn row_to_request(row: &rusqlite::Row) -> rusqlite::Result<SyncRequest> {
    let kind: String = row.get(1)?;
    let target = SyncTarget::from_parts(&kind, row.get(2)?).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            Type::Text,
            format!("unknown target kind '{}'", kind).into(),
        )
    })?;
    let state_str: String = row.get(4)?;
    let state = RequestState::parse(&state_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            Type::Text,
            format!("unknown request state '{}'", state_str).into(),
        )
    })?;

    Ok(SyncRequest {
        id: row.get(0)?,
        target,
        invalidate_caches: row.get(3)?,
        state,
        queued_at: from_unix(5, row.get(5)?)?,
        started_at: from_unix_opt(6, row.get(6)?)?,
        finished_at: from_unix_opt(7, row.get(7)?)?,
        observed_token: row.get(8)?,
        failure_message: row.get(9)?,
    })
}

fn load_request(conn: &Connection, request_id: i64) -> StoreResult<SyncRequest> {
    conn.query_row(
        &format!("SELECT {REQUEST_COLUMNS} FROM permission_sync_requests WHERE id = ?1"),
        params![request_id],
        row_to_request,
    )
    .optional()?
    .ok_or(StoreError::UnknownRequest(request_id))
}

/// Queues a request unless one is already pending for the same target.
/// Must run inside a write transaction.
pub(crate) fn enqueue_request(
    conn: &Connection,
    target: SyncTarget,
    invalidate_caches: bool,
    now: DateTime<Utc>,
) -> StoreResult<SyncOutcome> {
    let pending: Option<i64> = conn
        .query_row(
            "SELECT id FROM permission_sync_requests
             WHERE target_kind = ?1 AND target_id = ?2 AND state = 'pending'
             ORDER BY id LIMIT 1",
            params![target.kind_str(), target.id()],
            |row| row.get(0),
        )
        .optional()?;

    if let Some(existing) = pending {
        if invalidate_caches {
            conn.execute(
                "UPDATE permission_sync_requests SET invalidate_caches = 1 WHERE id = ?1",
                params![existing],
            )?;
        }
        debug!("Sync for {:?} already pending as request {}", target, existing);
        return Ok(SyncOutcome::AlreadyPending);
    }

    conn.execute(
        "INSERT INTO permission_sync_requests
            (target_kind, target_id, invalidate_caches, state, queued_at)
         VALUES (?1, ?2, ?3, 'pending', ?4)",
        params![target.kind_str(), target.id(), invalidate_caches, to_unix(now)],
    )?;
    debug!(
        "Queued sync request {} for {:?}",
        conn.last_insert_rowid(),
        target
    );
    Ok(SyncOutcome::Accepted)
}

const DEFAULT_STALL_THRESHOLD: Duration = Duration::from_secs(600);

#[derive(Clone)]
pub struct SqliteSyncRequestQueue {
    db: UpkeepDb,
    stall_threshold: Duration,
}

impl SqliteSyncRequestQueue {
    pub fn new(db: UpkeepDb) -> Self {
        Self {
            db,
            stall_threshold: DEFAULT_STALL_THRESHOLD,
        }
    }

    pub fn with_stall_threshold(mut self, stall_threshold: Duration) -> Self {
        self.stall_threshold = stall_threshold;
        self
    }
}

impl SyncRequestQueue for SqliteSyncRequestQueue {
    fn claim_next(&self, now: DateTime<Utc>) -> StoreResult<Option<SyncRequest>> {
        self.db.write(|tx| {
            let claimed = tx
                .query_row(
                    &format!(
                        "UPDATE permission_sync_requests
                         SET state = 'processing', started_at = ?1
                         WHERE id = (
                             SELECT id FROM permission_sync_requests
                             WHERE state = 'pending'
                             ORDER BY queued_at, id
                             LIMIT 1
                         )
                         RETURNING {REQUEST_COLUMNS}"
                    ),
                    params![to_unix(now)],
                    row_to_request,
                )
                .optional()?;

            let Some(mut request) = claimed else {
                return Ok(None);
            };
            if let SyncTarget::Repository(repository_id) = request.target {
                let token = staleness::current_dirty_token(tx, repository_id)?;
                tx.execute(
                    "UPDATE permission_sync_requests SET observed_token = ?2 WHERE id = ?1",
                    params![request.id, token],
                )?;
                request.observed_token = Some(token);
            }
            debug!("Claimed sync request {} for {:?}", request.id, request.target);
            Ok(Some(request))
        })
    }

    fn finish(
        &self,
        request_id: i64,
        succeeded: bool,
        message: Option<&str>,
        now: DateTime<Utc>,
    ) -> StoreResult<SyncRequest> {
        self.db.write(|tx| {
            let request = load_request(tx, request_id)?;
            if request.state != RequestState::Processing {
                return Err(StoreError::InvalidTransition {
                    job_id: request_id,
                    state: request.state.as_str().to_string(),
                    action: "finish request",
                });
            }

            let state = if succeeded {
                RequestState::Completed
            } else {
                RequestState::Failed
            };
            tx.execute(
                "UPDATE permission_sync_requests
                 SET state = ?2, finished_at = ?3, failure_message = ?4
                 WHERE id = ?1",
                params![request_id, state.as_str(), to_unix(now), message],
            )?;

            if let (true, SyncTarget::Repository(repository_id), Some(observed)) =
                (succeeded, request.target, request.observed_token)
            {
                match staleness::consume(tx, repository_id, observed) {
                    Ok(still_stale) => debug!(
                        "Repository {} permissions synced, still stale: {}",
                        repository_id, still_stale
                    ),
                    // Deleted while the sync ran; nothing left to consume
                    Err(StoreError::UnknownRepository(_)) => {
                        warn!("Repository {} vanished during sync", repository_id)
                    }
                    Err(e) => return Err(e),
                }
            }
            load_request(tx, request_id)
        })
    }

    fn reset_stalled(&self, now: DateTime<Utc>) -> StoreResult<StalledRequests> {
        let cutoff = to_unix(now) - self.stall_threshold.as_secs() as i64;
        let outcome = self.db.write(|tx| {
            let stalled = {
                let mut stmt = tx.prepare(&format!(
                    "SELECT {REQUEST_COLUMNS} FROM permission_sync_requests
                     WHERE state = 'processing' AND started_at <= ?1
                     ORDER BY queued_at, id"
                ))?;
                let rows = stmt
                    .query_map(params![cutoff], row_to_request)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            };

            let mut outcome = StalledRequests::default();
            for request in stalled {
                tx.execute(
                    "UPDATE permission_sync_requests
                     SET state = 'failed', finished_at = ?2, failure_message = 'claim expired'
                     WHERE id = ?1",
                    params![request.id, to_unix(now)],
                )?;
                match enqueue_request(tx, request.target, request.invalidate_caches, now)? {
                    SyncOutcome::Accepted => outcome.requeued += 1,
                    SyncOutcome::AlreadyPending => outcome.merged += 1,
                }
            }
            Ok(outcome)
        })?;
        if outcome.requeued + outcome.merged > 0 {
            warn!(
                "Reset stalled sync requests: {} requeued, {} merged into pending",
                outcome.requeued, outcome.merged
            );
        }
        Ok(outcome)
    }

    fn get(&self, request_id: i64) -> StoreResult<SyncRequest> {
        self.db.read(|conn| load_request(conn, request_id))
    }

    fn list_pending(&self) -> StoreResult<Vec<SyncRequest>> {
        self.db.read(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {REQUEST_COLUMNS} FROM permission_sync_requests
                 WHERE state = 'pending'
                 ORDER BY queued_at, id"
            ))?;
            let requests = stmt
                .query_map([], row_to_request)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(requests)
        })
    }
}
