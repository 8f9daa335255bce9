use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use repo_upkeep::background_jobs::jobs::{
    LoggingScanSink, PatternRefreshJob, PermissionSyncWorkerJob, RepositoryScanJob,
    StalenessReportJob, StalledJobResetterJob, SyncRequestWorkerJob,
};
use repo_upkeep::background_jobs::{create_scheduler, JobContext};
use repo_upkeep::clock::{Clock, SystemClock};
use repo_upkeep::code_host::{CodeHostClient, HttpCodeHostClient};
use repo_upkeep::config::{AppConfig, CliConfig, FileConfig};
use repo_upkeep::metrics;
use repo_upkeep::permission_jobs::{
    JobQueue, JobState, ListJobsArgs, Permission, SqliteJobQueue, UserPermission,
};
use repo_upkeep::policy::{PolicyEngine, ScanKind, SqlitePolicyEngine};
use repo_upkeep::scan::{CandidateSelector, SqliteCandidateSelector};
use repo_upkeep::staleness::{SqliteStalenessStore, StalenessStore};
use repo_upkeep::store::{UpkeepDb, DEFAULT_BUSY_TIMEOUT};
use repo_upkeep::sync::{SqliteSyncOrchestrator, SqliteSyncRequestQueue, SyncOrchestrator};

fn parse_path(s: &str) -> Result<PathBuf> {
    let original_path = PathBuf::from(s);
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(original_path))
}

fn parse_scan_kind(s: &str) -> Result<ScanKind, String> {
    ScanKind::parse(&s.to_ascii_lowercase())
        .ok_or_else(|| format!("unknown scan kind '{}', expected indexing or retention", s))
}

fn parse_job_state(s: &str) -> Result<JobState, String> {
    JobState::parse(s).ok_or_else(|| format!("unknown job state '{}'", s))
}

/// `bind_id:PERMISSION`, e.g. `alice:WRITE`.
fn parse_grant(s: &str) -> Result<UserPermission, String> {
    let (bind_id, permission) = s
        .rsplit_once(':')
        .ok_or_else(|| format!("expected bind_id:PERMISSION, got '{}'", s))?;
    if bind_id.is_empty() {
        return Err(format!("empty bind id in '{}'", s));
    }
    let permission = Permission::parse(permission)
        .ok_or_else(|| format!("unknown permission '{}'", permission))?;
    Ok(UserPermission::new(bind_id, permission))
}

#[derive(Parser, Debug)]
struct CliArgs {
    /// Path to the SQLite upkeep database file.
    #[clap(long, global = true, value_parser = parse_path)]
    pub db_path: Option<PathBuf>,

    /// Path to a TOML config file. Its values override CLI arguments.
    #[clap(long, global = true, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// How long to wait for another instance's write lock, in milliseconds.
    #[clap(long, global = true, default_value_t = DEFAULT_BUSY_TIMEOUT.as_millis() as u64)]
    pub busy_timeout_ms: u64,

    /// The port for the metrics server (Prometheus scraping).
    #[clap(long, global = true, default_value_t = 9091)]
    pub metrics_port: u16,

    /// Base URL of the code host permission API.
    #[clap(long, global = true)]
    pub code_host_url: Option<String>,

    /// Timeout in seconds for code host requests.
    #[clap(long, global = true, default_value_t = 30)]
    pub code_host_timeout_sec: u64,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the scheduler, the queue workers and the metrics endpoint.
    Serve,

    /// Record that a repository's permissions need recomputing.
    MarkDirty { repository_id: i64 },

    /// Show stale repositories and their dirty tokens.
    ListDirty,

    /// Show how long the oldest stale repository has been waiting.
    MaxStaleAge,

    /// Claim the repositories due for a scan.
    SelectCandidates {
        #[clap(value_parser = parse_scan_kind)]
        kind: ScanKind,
        /// Overrides the configured process delay.
        #[clap(long)]
        process_delay_secs: Option<u64>,
        /// Overrides the configured batch limit.
        #[clap(long)]
        limit: Option<usize>,
        /// Include global policies that allow it.
        #[clap(long)]
        allow_global_policies: bool,
        /// Cap on repositories contributed by global policies.
        #[clap(long)]
        repository_match_limit: Option<usize>,
    },

    /// Queue an immediate permission sync of one repository.
    ScheduleRepoSync { repository_id: i64 },

    /// Queue an immediate permission sync of one user.
    ScheduleUserSync {
        user_id: i64,
        #[clap(long)]
        invalidate_caches: bool,
    },

    /// Replace the explicit permissions of every repository in a project.
    SetProjectPermissions {
        project_key: String,
        external_service_id: i64,
        /// Repeatable `bind_id:PERMISSION` grant (READ, WRITE or ADMIN).
        #[clap(long = "grant", value_parser = parse_grant)]
        grants: Vec<UserPermission>,
        /// Mark the project's repositories as accessible to everyone.
        #[clap(long)]
        unrestricted: Option<bool>,
    },

    /// List permission sync jobs, oldest first.
    ListProjectJobs {
        /// Repeatable project key filter.
        #[clap(long = "project")]
        projects: Vec<String>,
        #[clap(long, value_parser = parse_job_state)]
        state: Option<JobState>,
        #[clap(long)]
        count: Option<usize>,
    },

    /// Cancel a queued permission sync job.
    CancelJob { job_id: i64 },

    /// Put an errored or failed permission sync job back in the queue.
    RequeueJob { job_id: i64 },

    /// Recompute the repository matches of every pattern policy.
    RefreshPatterns,
}

impl CliArgs {
    fn cli_config(&self) -> CliConfig {
        CliConfig {
            db_path: self.db_path.clone(),
            metrics_port: self.metrics_port,
            busy_timeout_ms: self.busy_timeout_ms,
            code_host_url: self.code_host_url.clone(),
            code_host_timeout_sec: self.code_host_timeout_sec,
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[derive(Serialize)]
struct MaxStaleAge {
    max_stale_age_secs: u64,
}

#[derive(Serialize)]
struct RefreshedPatterns {
    matches: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .context("Failed to install tracing subscriber")?;

    let file_config = match &cli_args.config {
        Some(path) => {
            info!("Loading config from {:?}", path);
            Some(FileConfig::load(path)?)
        }
        None => None,
    };
    let config = AppConfig::resolve(&cli_args.cli_config(), file_config)?;

    info!("Opening SQLite upkeep database at {:?}...", config.db_path);
    let db = UpkeepDb::open(&config.db_path, config.busy_timeout)?;

    match cli_args.command {
        Command::Serve => serve(config, db).await,
        command => run_command(command, &config, db),
    }
}

fn run_command(command: Command, config: &AppConfig, db: UpkeepDb) -> Result<()> {
    let now = SystemClock.now();
    let jobs = Arc::new(SqliteJobQueue::new(
        db.clone(),
        config.permission_jobs.retry_policy(),
        config.permission_jobs.stall_threshold(),
    ));

    match command {
        Command::Serve => bail!("serve is not a one-shot command"),
        Command::MarkDirty { repository_id } => {
            let token = SqliteStalenessStore::new(db).mark_dirty(repository_id, now)?;
            print_json(&serde_json::json!({ "repository_id": repository_id, "dirty_token": token }))
        }
        Command::ListDirty => {
            let dirty = SqliteStalenessStore::new(db).list_dirty()?;
            print_json(&dirty)
        }
        Command::MaxStaleAge => {
            let age = SqliteStalenessStore::new(db).max_stale_age(now)?;
            print_json(&MaxStaleAge {
                max_stale_age_secs: age.as_secs(),
            })
        }
        Command::SelectCandidates {
            kind,
            process_delay_secs,
            limit,
            allow_global_policies,
            repository_match_limit,
        } => {
            let settings = match kind {
                ScanKind::Indexing => &config.index_scan,
                ScanKind::Retention => &config.retention_scan,
            };
            let mut options = settings.scan_options();
            if let Some(secs) = process_delay_secs {
                options.process_delay = Duration::from_secs(secs);
            }
            if let Some(limit) = limit {
                options.limit = limit;
            }
            options.allow_global_policies |= allow_global_policies;
            if repository_match_limit.is_some() {
                options.repository_match_limit = repository_match_limit;
            }
            let claimed = SqliteCandidateSelector::new(db).select_and_claim(kind, &options, now)?;
            print_json(&claimed)
        }
        Command::ScheduleRepoSync { repository_id } => {
            let outcome =
                SqliteSyncOrchestrator::new(db, jobs).schedule_repository_sync(repository_id, now)?;
            print_json(&outcome)
        }
        Command::ScheduleUserSync {
            user_id,
            invalidate_caches,
        } => {
            let outcome = SqliteSyncOrchestrator::new(db, jobs).schedule_user_sync(
                user_id,
                invalidate_caches,
                now,
            )?;
            print_json(&outcome)
        }
        Command::SetProjectPermissions {
            project_key,
            external_service_id,
            grants,
            unrestricted,
        } => {
            let job = SqliteSyncOrchestrator::new(db, jobs).set_bitbucket_project_permissions(
                &project_key,
                external_service_id,
                grants,
                unrestricted,
                now,
            )?;
            print_json(&job)
        }
        Command::ListProjectJobs {
            projects,
            state,
            count,
        } => {
            let args = ListJobsArgs {
                project_keys: (!projects.is_empty()).then_some(projects),
                state,
                count,
            };
            let listed =
                SqliteSyncOrchestrator::new(db, jobs).list_bitbucket_project_permission_jobs(&args)?;
            print_json(&listed)
        }
        Command::CancelJob { job_id } => print_json(&jobs.cancel(job_id, now)?),
        Command::RequeueJob { job_id } => print_json(&jobs.requeue(job_id)?),
        Command::RefreshPatterns => {
            let matches = SqlitePolicyEngine::new(db).refresh_all_pattern_matches()?;
            print_json(&RefreshedPatterns { matches })
        }
    }
}

async fn serve(config: AppConfig, db: UpkeepDb) -> Result<()> {
    info!("Initializing metrics...");
    metrics::init_metrics();

    let shutdown_token = CancellationToken::new();
    {
        let token = shutdown_token.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Received Ctrl-C, shutting down..."),
                Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
            }
            token.cancel();
        });
    }

    let metrics_port = config.metrics_port;
    let metrics_token = shutdown_token.clone();
    let metrics_server = tokio::spawn(async move {
        if let Err(e) = metrics::serve_metrics(metrics_port, metrics_token).await {
            error!("{:#}", e);
        }
    });
    info!("Metrics available at port {}!", metrics_port);

    let staleness = Arc::new(SqliteStalenessStore::new(db.clone()));
    let policies = Arc::new(SqlitePolicyEngine::new(db.clone()));
    let selector = Arc::new(SqliteCandidateSelector::new(db.clone()));
    let job_queue: Arc<dyn JobQueue> = Arc::new(SqliteJobQueue::new(
        db.clone(),
        config.permission_jobs.retry_policy(),
        config.permission_jobs.stall_threshold(),
    ));
    let requests = Arc::new(
        SqliteSyncRequestQueue::new(db).with_stall_threshold(config.sync_requests.stall_threshold()),
    );

    let job_context = JobContext::new(shutdown_token.child_token(), Arc::new(SystemClock));
    let (mut scheduler, handle) = create_scheduler(shutdown_token.clone(), job_context);

    let sink = Arc::new(LoggingScanSink);
    scheduler
        .register_job(Arc::new(RepositoryScanJob::new(
            ScanKind::Indexing,
            selector.clone(),
            sink.clone(),
            config.index_scan.scan_options(),
            config.index_scan.interval(),
        )))
        .await;
    scheduler
        .register_job(Arc::new(RepositoryScanJob::new(
            ScanKind::Retention,
            selector,
            sink,
            config.retention_scan.scan_options(),
            config.retention_scan.interval(),
        )))
        .await;
    scheduler
        .register_job(Arc::new(StalledJobResetterJob::new(
            job_queue.clone(),
            requests.clone(),
            Duration::from_secs(config.permission_jobs.stall_check_interval_secs),
        )))
        .await;
    scheduler
        .register_job(Arc::new(StalenessReportJob::new(
            staleness,
            Duration::from_secs(config.background_jobs.staleness_report_interval_secs),
        )))
        .await;
    scheduler
        .register_job(Arc::new(PatternRefreshJob::new(
            policies,
            Duration::from_secs(config.background_jobs.pattern_refresh_interval_secs),
        )))
        .await;

    match &config.code_host_url {
        Some(url) => {
            info!("Code host configured at {}", url);
            let client: Arc<dyn CodeHostClient> = Arc::new(HttpCodeHostClient::new(
                url.clone(),
                config.code_host_timeout_sec,
                tokio::runtime::Handle::current(),
            )?);
            scheduler
                .register_job(Arc::new(PermissionSyncWorkerJob::new(
                    job_queue,
                    client.clone(),
                    config.permission_jobs.batch_size,
                    Duration::from_secs(config.permission_jobs.poll_interval_secs),
                )))
                .await;
            scheduler
                .register_job(Arc::new(SyncRequestWorkerJob::new(
                    requests,
                    client,
                    config.sync_requests.batch_size,
                    Duration::from_secs(config.sync_requests.poll_interval_secs),
                )))
                .await;
        }
        None => warn!("No code host URL configured, permission sync workers are disabled"),
    }

    for job in handle.list_jobs().await {
        info!("Scheduled job {} ({})", job.id, job.description);
    }

    scheduler.run().await;
    let _ = metrics_server.await;
    Ok(())
}
