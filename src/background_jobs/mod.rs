//! Background job scheduling and execution system.
//!
//! Runs the periodic maintenance work of `serve`: scans, queue workers,
//! stalled lease recovery and metric reports.

mod context;
mod handle;
mod job;
pub mod jobs;
mod scheduler;

pub use context::JobContext;
pub use handle::{JobInfo, JobRun, JobRunStatus, SchedulerHandle};
pub use job::{BackgroundJob, HookEvent, JobError, JobSchedule, ShutdownBehavior};
pub use scheduler::{create_scheduler, JobScheduler};
