use super::job::{BackgroundJob, JobError, JobSchedule};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, RwLock};

/// How many finished runs are kept per job.
pub const RUN_HISTORY_LEN: usize = 20;

/// Information about a registered job.
#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub id: String,
    pub name: String,
    pub description: String,
    pub schedule: JobScheduleInfo,
    pub is_running: bool,
    pub last_run: Option<JobRun>,
    pub next_run_at: Option<DateTime<Utc>>,
}

/// Serializable schedule information.
#[derive(Debug, Clone, Serialize)]
pub struct JobScheduleInfo {
    #[serde(rename = "type")]
    pub schedule_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hooks: Option<Vec<String>>,
}

impl From<JobSchedule> for JobScheduleInfo {
    fn from(schedule: JobSchedule) -> Self {
        match schedule {
            JobSchedule::Interval(duration) => JobScheduleInfo {
                schedule_type: "interval".to_string(),
                value_secs: Some(duration.as_secs()),
                hooks: None,
            },
            JobSchedule::Hook(event) => JobScheduleInfo {
                schedule_type: "hook".to_string(),
                hooks: Some(vec![event.to_string()]),
                value_secs: None,
            },
            JobSchedule::Combined { interval, hooks } => JobScheduleInfo {
                schedule_type: "combined".to_string(),
                value_secs: interval.map(|d| d.as_secs()),
                hooks: Some(hooks.iter().map(|h| h.to_string()).collect()),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobRunStatus {
    Completed,
    Failed,
    Cancelled,
}

impl JobRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobRunStatus::Completed => "completed",
            JobRunStatus::Failed => "failed",
            JobRunStatus::Cancelled => "cancelled",
        }
    }
}

/// One finished execution of a job.
#[derive(Debug, Clone, Serialize)]
pub struct JobRun {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: JobRunStatus,
    pub error_message: Option<String>,
    pub triggered_by: String,
}

/// Command sent to the scheduler.
pub enum SchedulerCommand {
    TriggerJob {
        job_id: String,
        response: oneshot::Sender<Result<(), JobError>>,
    },
}

/// Shared state between scheduler and handle.
#[derive(Default)]
pub struct SharedJobState {
    /// Set at registration, never changes
    pub jobs: HashMap<String, Arc<dyn BackgroundJob>>,
    pub running_jobs: HashSet<String>,
    pub next_runs: HashMap<String, DateTime<Utc>>,
    /// Newest first, at most `RUN_HISTORY_LEN` per job
    pub history: HashMap<String, VecDeque<JobRun>>,
}

impl SharedJobState {
    pub(crate) fn record_run(&mut self, job_id: &str, run: JobRun) {
        let runs = self.history.entry(job_id.to_string()).or_default();
        runs.push_front(run);
        runs.truncate(RUN_HISTORY_LEN);
    }
}

/// Handle to interact with a running job scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    command_tx: mpsc::Sender<SchedulerCommand>,
    shared_state: Arc<RwLock<SharedJobState>>,
}

impl SchedulerHandle {
    pub fn new(
        command_tx: mpsc::Sender<SchedulerCommand>,
        shared_state: Arc<RwLock<SharedJobState>>,
    ) -> Self {
        Self {
            command_tx,
            shared_state,
        }
    }

    /// Information about all registered jobs, sorted by id.
    pub async fn list_jobs(&self) -> Vec<JobInfo> {
        let state = self.shared_state.read().await;
        let mut jobs: Vec<JobInfo> = state
            .jobs
            .iter()
            .map(|(job_id, job)| job_info(&state, job_id, job.as_ref()))
            .collect();
        jobs.sort_by(|a, b| a.id.cmp(&b.id));
        jobs
    }

    pub async fn get_job(&self, job_id: &str) -> Option<JobInfo> {
        let state = self.shared_state.read().await;
        state
            .jobs
            .get(job_id)
            .map(|job| job_info(&state, job_id, job.as_ref()))
    }

    /// Trigger a job manually.
    pub async fn trigger_job(&self, job_id: &str) -> Result<(), JobError> {
        let (response_tx, response_rx) = oneshot::channel();

        self.command_tx
            .send(SchedulerCommand::TriggerJob {
                job_id: job_id.to_string(),
                response: response_tx,
            })
            .await
            .map_err(|_| JobError::ExecutionFailed("Scheduler not available".to_string()))?;

        response_rx
            .await
            .map_err(|_| JobError::ExecutionFailed("Scheduler did not respond".to_string()))?
    }

    /// Finished runs of a job, newest first.
    pub async fn get_job_history(&self, job_id: &str, limit: usize) -> Vec<JobRun> {
        let state = self.shared_state.read().await;
        state
            .history
            .get(job_id)
            .map(|runs| runs.iter().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    pub async fn is_job_running(&self, job_id: &str) -> bool {
        let state = self.shared_state.read().await;
        state.running_jobs.contains(job_id)
    }

    pub async fn job_exists(&self, job_id: &str) -> bool {
        let state = self.shared_state.read().await;
        state.jobs.contains_key(job_id)
    }
}

fn job_info(state: &SharedJobState, job_id: &str, job: &dyn BackgroundJob) -> JobInfo {
    JobInfo {
        id: job_id.to_string(),
        name: job.name().to_string(),
        description: job.description().to_string(),
        schedule: job.schedule().into(),
        is_running: state.running_jobs.contains(job_id),
        last_run: state
            .history
            .get(job_id)
            .and_then(|runs| runs.front().cloned()),
        next_run_at: state.next_runs.get(job_id).copied(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::background_jobs::job::HookEvent;
    use std::time::Duration;

    #[test]
    fn test_job_schedule_info_from_interval() {
        let info: JobScheduleInfo = JobSchedule::Interval(Duration::from_secs(3600)).into();

        assert_eq!(info.schedule_type, "interval");
        assert_eq!(info.value_secs, Some(3600));
        assert!(info.hooks.is_none());
    }

    #[test]
    fn test_job_schedule_info_from_combined() {
        let info: JobScheduleInfo = JobSchedule::Combined {
            interval: Some(Duration::from_secs(300)),
            hooks: vec![HookEvent::OnStartup],
        }
        .into();

        assert_eq!(info.schedule_type, "combined");
        assert_eq!(info.value_secs, Some(300));
        assert_eq!(info.hooks, Some(vec!["OnStartup".to_string()]));
    }

    #[test]
    fn test_history_is_bounded_and_newest_first() {
        let mut state = SharedJobState::default();
        for i in 0..(RUN_HISTORY_LEN as i64 + 5) {
            let at = DateTime::from_timestamp(i, 0).unwrap();
            state.record_run(
                "job",
                JobRun {
                    started_at: at,
                    finished_at: at,
                    status: JobRunStatus::Completed,
                    error_message: None,
                    triggered_by: "schedule".to_string(),
                },
            );
        }

        let runs = &state.history["job"];
        assert_eq!(runs.len(), RUN_HISTORY_LEN);
        assert_eq!(runs[0].started_at.timestamp(), RUN_HISTORY_LEN as i64 + 4);
    }
}
