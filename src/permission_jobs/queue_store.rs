//! SQLite-backed permission sync job queue.
//!
//! Every transition loads the job and rewrites it inside one `BEGIN
//! IMMEDIATE` transaction, and leasing is a single conditional `UPDATE ...
//! RETURNING`, so two workers can never both own a job.

use super::models::*;
use super::retry_policy::RetryPolicy;
use super::{JobQueue, StalledReset};
use crate::error::{StoreError, StoreResult};
use crate::metrics;
use crate::sqlite_persistence::{from_unix, from_unix_opt, to_unix};
use crate::store::UpkeepDb;
use chrono::{DateTime, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::time::Duration;
use tracing::{debug, info, warn};

const JOB_COLUMNS: &str = "id, state, failure_message, queued_at, started_at, finished_at, \
     process_after, num_resets, num_failures, project_key, external_service_id, permissions, \
     unrestricted, lease_id";

fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<PermissionSyncJob> {
    let state_str: String = row.get(1)?;
    let state = JobState::parse(&state_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            Type::Text,
            format!("unknown job state '{}'", state_str).into(),
        )
    })?;
    let permissions_json: String = row.get(11)?;
    let permissions: Vec<UserPermission> = serde_json::from_str(&permissions_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(11, Type::Text, Box::new(e)))?;

    Ok(PermissionSyncJob {
        id: row.get(0)?,
        state,
        failure_message: row.get(2)?,
        queued_at: from_unix(3, row.get(3)?)?,
        started_at: from_unix_opt(4, row.get(4)?)?,
        finished_at: from_unix_opt(5, row.get(5)?)?,
        process_after: from_unix_opt(6, row.get(6)?)?,
        num_resets: row.get(7)?,
        num_failures: row.get(8)?,
        project_key: row.get(9)?,
        external_service_id: row.get(10)?,
        permissions,
        unrestricted: row.get(12)?,
        lease_id: row.get(13)?,
    })
}

pub(crate) fn load_job(conn: &Connection, job_id: i64) -> StoreResult<PermissionSyncJob> {
    conn.query_row(
        &format!("SELECT {JOB_COLUMNS} FROM permission_sync_jobs WHERE id = ?1"),
        params![job_id],
        row_to_job,
    )
    .optional()?
    .ok_or(StoreError::UnknownJob(job_id))
}

/// Inserts a queued job on `conn` and returns its id.
pub(crate) fn enqueue(conn: &Connection, job: &NewPermissionJob, now: DateTime<Utc>) -> StoreResult<i64> {
    conn.execute(
        "INSERT INTO permission_sync_jobs
            (state, queued_at, num_resets, num_failures, project_key, external_service_id,
             permissions, unrestricted)
         VALUES (?1, ?2, 0, 0, ?3, ?4, ?5, ?6)",
        params![
            JobState::Queued.as_str(),
            to_unix(now),
            job.project_key,
            job.external_service_id,
            serde_json::to_string(&job.permissions)?,
            job.unrestricted,
        ],
    )?;
    let id = conn.last_insert_rowid();
    debug!(
        "Enqueued permission job {} for project {} ({} permissions)",
        id,
        job.project_key,
        job.permissions.len()
    );
    Ok(id)
}

fn invalid_transition(job: &PermissionSyncJob, action: &'static str) -> StoreError {
    StoreError::InvalidTransition {
        job_id: job.id,
        state: job.state.as_str().to_string(),
        action,
    }
}

/// A processing job may only be reported on by the worker holding its
/// current lease. Anything else is a late report from a lease that a stall
/// reset already took away.
fn check_lease(job: &PermissionSyncJob, lease_id: i64, action: &'static str) -> StoreResult<()> {
    if job.state != JobState::Processing {
        return Err(invalid_transition(job, action));
    }
    if job.lease_id != lease_id {
        warn!(
            "Rejected report on permission job {} from lease {} (current lease {})",
            job.id, lease_id, job.lease_id
        );
        return Err(invalid_transition(job, "report on a superseded lease of job"));
    }
    Ok(())
}

fn add(now: DateTime<Utc>, delay: Duration) -> i64 {
    to_unix(now).saturating_add(delay.as_secs().min(i64::MAX as u64) as i64)
}

pub struct SqliteJobQueue {
    db: UpkeepDb,
    retry_policy: RetryPolicy,
    stall_threshold: Duration,
}

impl SqliteJobQueue {
    pub fn new(db: UpkeepDb, retry_policy: RetryPolicy, stall_threshold: Duration) -> Self {
        Self {
            db,
            retry_policy,
            stall_threshold,
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }
}

impl JobQueue for SqliteJobQueue {
    fn enqueue(&self, job: NewPermissionJob, now: DateTime<Utc>) -> StoreResult<PermissionSyncJob> {
        self.db.write(|tx| {
            let id = enqueue(tx, &job, now)?;
            load_job(tx, id)
        })
    }

    fn lease(&self, now: DateTime<Utc>) -> StoreResult<Option<PermissionSyncJob>> {
        let leased = self.db.write(|tx| {
            let job = tx
                .query_row(
                    &format!(
                        "UPDATE permission_sync_jobs
                         SET state = 'PROCESSING', started_at = ?1, lease_id = lease_id + 1
                         WHERE id = (
                             SELECT id FROM permission_sync_jobs
                             WHERE state = 'QUEUED'
                               AND (process_after IS NULL OR process_after <= ?1)
                             ORDER BY queued_at, id
                             LIMIT 1
                         )
                         RETURNING {JOB_COLUMNS}"
                    ),
                    params![to_unix(now)],
                    row_to_job,
                )
                .optional()?;
            Ok(job)
        })?;
        if let Some(job) = &leased {
            debug!(
                "Leased permission job {} (project {}, lease {})",
                job.id, job.project_key, job.lease_id
            );
            metrics::record_job_transition("leased");
        }
        Ok(leased)
    }

    fn complete(&self, job_id: i64, lease_id: i64, now: DateTime<Utc>) -> StoreResult<PermissionSyncJob> {
        let job = self.db.write(|tx| {
            let job = load_job(tx, job_id)?;
            check_lease(&job, lease_id, "complete job")?;
            tx.execute(
                "UPDATE permission_sync_jobs SET state = 'COMPLETED', finished_at = ?2 WHERE id = ?1",
                params![job_id, to_unix(now)],
            )?;
            load_job(tx, job_id)
        })?;
        debug!("Permission job {} completed", job_id);
        metrics::record_job_transition("completed");
        Ok(job)
    }

    fn fail(
        &self,
        job_id: i64,
        lease_id: i64,
        message: &str,
        retryable: bool,
        now: DateTime<Utc>,
    ) -> StoreResult<PermissionSyncJob> {
        let job = self.db.write(|tx| {
            let job = load_job(tx, job_id)?;
            check_lease(&job, lease_id, "fail job")?;

            if retryable && self.retry_policy.can_reset(job.num_failures) {
                let num_failures = job.num_failures + 1;
                let process_after = add(now, self.retry_policy.backoff(num_failures));
                tx.execute(
                    "UPDATE permission_sync_jobs
                     SET state = 'QUEUED',
                         num_failures = ?2,
                         num_resets = num_resets + 1,
                         process_after = ?3,
                         started_at = NULL,
                         failure_message = ?4
                     WHERE id = ?1",
                    params![job_id, num_failures, process_after, message],
                )?;
            } else {
                tx.execute(
                    "UPDATE permission_sync_jobs
                     SET state = 'FAILED', finished_at = ?2, failure_message = ?3
                     WHERE id = ?1",
                    params![job_id, to_unix(now), message],
                )?;
            }
            load_job(tx, job_id)
        })?;

        if job.state == JobState::Queued {
            info!(
                "Permission job {} failed (attempt {}), retrying after {:?}: {}",
                job_id, job.num_failures, job.process_after, message
            );
            metrics::record_job_transition("retried");
        } else {
            warn!("Permission job {} failed permanently: {}", job_id, message);
            metrics::record_job_transition("failed");
        }
        Ok(job)
    }

    fn cancel(&self, job_id: i64, now: DateTime<Utc>) -> StoreResult<PermissionSyncJob> {
        let job = self.db.write(|tx| {
            let job = load_job(tx, job_id)?;
            if job.state != JobState::Queued {
                return Err(invalid_transition(&job, "cancel job"));
            }
            tx.execute(
                "UPDATE permission_sync_jobs SET state = 'CANCELED', finished_at = ?2 WHERE id = ?1",
                params![job_id, to_unix(now)],
            )?;
            load_job(tx, job_id)
        })?;
        info!("Permission job {} canceled", job_id);
        metrics::record_job_transition("canceled");
        Ok(job)
    }

    fn requeue(&self, job_id: i64) -> StoreResult<PermissionSyncJob> {
        let job = self.db.write(|tx| {
            let job = load_job(tx, job_id)?;
            let resettable = matches!(job.state, JobState::Errored | JobState::Failed)
                && job.num_resets < self.retry_policy.max_resets;
            if !resettable {
                return Err(invalid_transition(&job, "requeue job"));
            }
            tx.execute(
                "UPDATE permission_sync_jobs
                 SET state = 'QUEUED',
                     num_resets = num_resets + 1,
                     process_after = NULL,
                     started_at = NULL,
                     finished_at = NULL
                 WHERE id = ?1",
                params![job_id],
            )?;
            load_job(tx, job_id)
        })?;
        info!("Permission job {} requeued (reset {})", job_id, job.num_resets);
        metrics::record_job_transition("requeued");
        Ok(job)
    }

    fn reset_stalled(&self, now: DateTime<Utc>) -> StoreResult<StalledReset> {
        let cutoff = to_unix(now) - self.stall_threshold.as_secs() as i64;
        let max_resets = self.retry_policy.max_resets;
        let outcome = self.db.write(|tx| {
            let requeued = tx.execute(
                "UPDATE permission_sync_jobs
                 SET state = 'QUEUED', num_resets = num_resets + 1, started_at = NULL,
                     failure_message = 'lease expired'
                 WHERE state = 'PROCESSING' AND started_at <= ?1 AND num_resets < ?2",
                params![cutoff, max_resets],
            )?;
            let errored = tx.execute(
                "UPDATE permission_sync_jobs
                 SET state = 'ERRORED', finished_at = ?3,
                     failure_message = 'lease expired and no resets left'
                 WHERE state = 'PROCESSING' AND started_at <= ?1 AND num_resets >= ?2",
                params![cutoff, max_resets, to_unix(now)],
            )?;
            Ok(StalledReset { requeued, errored })
        })?;
        if outcome.requeued + outcome.errored > 0 {
            warn!(
                "Reset stalled permission jobs: {} requeued, {} errored",
                outcome.requeued, outcome.errored
            );
            for _ in 0..outcome.requeued {
                metrics::record_job_transition("stall_requeued");
            }
            for _ in 0..outcome.errored {
                metrics::record_job_transition("stall_errored");
            }
        }
        Ok(outcome)
    }

    fn get(&self, job_id: i64) -> StoreResult<PermissionSyncJob> {
        self.db.read(|conn| load_job(conn, job_id))
    }

    fn list(&self, args: &ListJobsArgs) -> StoreResult<Vec<PermissionSyncJob>> {
        self.db.read(|conn| list_jobs(conn, args))
    }
}

fn list_jobs(conn: &Connection, args: &ListJobsArgs) -> StoreResult<Vec<PermissionSyncJob>> {
    let mut conditions: Vec<String> = Vec::new();
    let mut values: Vec<Value> = Vec::new();

    if let Some(keys) = &args.project_keys {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        conditions.push(format!("project_key IN ({})", vec!["?"; keys.len()].join(", ")));
        values.extend(keys.iter().cloned().map(Value::Text));
    }
    if let Some(state) = args.state {
        conditions.push("state = ?".to_string());
        values.push(Value::Text(state.as_str().to_string()));
    }
    values.push(Value::Integer(args.effective_count() as i64));

    let where_clause = if conditions.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", conditions.join(" AND "))
    };
    let mut stmt = conn.prepare(&format!(
        "SELECT {JOB_COLUMNS} FROM permission_sync_jobs {where_clause}
         ORDER BY queued_at, id
         LIMIT ?"
    ))?;
    let jobs = stmt
        .query_map(params_from_iter(values.iter()), row_to_job)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(jobs)
}
