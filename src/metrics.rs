use anyhow::{Context, Result};
use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Metric name prefix for all repo-upkeep metrics
const PREFIX: &str = "repo_upkeep";

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Staleness
    pub static ref DIRTY_REPOSITORIES: Gauge = Gauge::new(
        format!("{PREFIX}_dirty_repositories"),
        "Number of live repositories whose derived data is stale"
    ).expect("Failed to create dirty_repositories metric");

    pub static ref MAX_STALE_AGE_SECONDS: Gauge = Gauge::new(
        format!("{PREFIX}_max_stale_age_seconds"),
        "Age of the oldest stale repository in seconds"
    ).expect("Failed to create max_stale_age_seconds metric");

    // Candidate selection
    pub static ref SCAN_CLAIMED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_scan_claimed_total"), "Repositories claimed for a scan"),
        &["scan_kind"]
    ).expect("Failed to create scan_claimed_total metric");

    // Permission sync jobs
    pub static ref PERMISSION_JOB_TRANSITIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            format!("{PREFIX}_permission_job_transitions_total"),
            "Permission sync job state transitions"
        ),
        &["transition"]
    ).expect("Failed to create permission_job_transitions_total metric");

    pub static ref SYNC_REQUESTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_sync_requests_total"), "Immediate permission sync requests"),
        &["target", "outcome"]
    ).expect("Failed to create sync_requests_total metric");

    // Background jobs
    pub static ref BACKGROUND_JOB_RUNS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_background_job_runs_total"), "Background job runs"),
        &["job_id", "status"]
    ).expect("Failed to create background_job_runs_total metric");

    pub static ref BACKGROUND_JOB_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_background_job_duration_seconds"),
            "Background job run duration in seconds"
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0]),
        &["job_id"]
    ).expect("Failed to create background_job_duration_seconds metric");

    pub static ref STORE_ERRORS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_store_errors_total"), "Failed store operations"),
        &["operation", "retryable"]
    ).expect("Failed to create store_errors_total metric");
}

/// Register all metrics with the Prometheus registry
pub fn init_metrics() {
    // Ignore errors if already registered (tests call this repeatedly)
    let _ = REGISTRY.register(Box::new(DIRTY_REPOSITORIES.clone()));
    let _ = REGISTRY.register(Box::new(MAX_STALE_AGE_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(SCAN_CLAIMED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(PERMISSION_JOB_TRANSITIONS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(SYNC_REQUESTS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(BACKGROUND_JOB_RUNS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(BACKGROUND_JOB_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(STORE_ERRORS_TOTAL.clone()));

    tracing::info!("Metrics system initialized successfully");
}

pub fn set_staleness(dirty_repositories: usize, max_stale_age: Duration) {
    DIRTY_REPOSITORIES.set(dirty_repositories as f64);
    MAX_STALE_AGE_SECONDS.set(max_stale_age.as_secs_f64());
}

pub fn record_scan_claims(scan_kind: &str, claimed: usize) {
    SCAN_CLAIMED_TOTAL
        .with_label_values(&[scan_kind])
        .inc_by(claimed as f64);
}

pub fn record_job_transition(transition: &str) {
    PERMISSION_JOB_TRANSITIONS_TOTAL
        .with_label_values(&[transition])
        .inc();
}

pub fn record_sync_request(target: &str, outcome: &str) {
    SYNC_REQUESTS_TOTAL.with_label_values(&[target, outcome]).inc();
}

pub fn record_background_job_run(job_id: &str, status: &str, duration: Duration) {
    BACKGROUND_JOB_RUNS_TOTAL
        .with_label_values(&[job_id, status])
        .inc();
    BACKGROUND_JOB_DURATION_SECONDS
        .with_label_values(&[job_id])
        .observe(duration.as_secs_f64());
}

pub fn record_store_error(operation: &str, err: &crate::error::StoreError) {
    let retryable = if err.is_retryable() { "true" } else { "false" };
    STORE_ERRORS_TOTAL
        .with_label_values(&[operation, retryable])
        .inc();
}

/// Handler for the /metrics endpoint
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = vec![];
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => {
            let response = String::from_utf8(buffer).unwrap_or_default();
            (StatusCode::OK, response)
        }
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {}", e),
            )
        }
    }
}

pub fn metrics_router() -> Router {
    Router::new().route("/metrics", get(metrics_handler))
}

/// Serves `/metrics` until `shutdown` is cancelled.
pub async fn serve_metrics(port: u16, shutdown: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port))
        .await
        .with_context(|| format!("Failed to bind metrics port {}", port))?;
    axum::serve(listener, metrics_router())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("Metrics server failed")
}
