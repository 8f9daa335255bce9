use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub db_path: Option<String>,
    pub metrics_port: Option<u16>,
    pub busy_timeout_ms: Option<u64>,
    pub code_host_url: Option<String>,
    pub code_host_timeout_sec: Option<u64>,

    // Feature configs
    pub index_scan: Option<ScanConfig>,
    pub retention_scan: Option<ScanConfig>,
    pub permission_jobs: Option<PermissionJobsConfig>,
    pub sync_requests: Option<SyncRequestsConfig>,
    pub background_jobs: Option<BackgroundJobsConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct ScanConfig {
    pub interval_secs: Option<u64>,
    pub process_delay_secs: Option<u64>,
    pub limit: Option<usize>,
    pub allow_global_policies: Option<bool>,
    pub repository_match_limit: Option<usize>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct PermissionJobsConfig {
    pub poll_interval_secs: Option<u64>,
    pub batch_size: Option<usize>,
    pub max_resets: Option<i64>,
    pub initial_backoff_secs: Option<u64>,
    pub max_backoff_secs: Option<u64>,
    pub backoff_multiplier: Option<f64>,
    pub stall_threshold_secs: Option<u64>,
    pub stall_check_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct SyncRequestsConfig {
    pub poll_interval_secs: Option<u64>,
    pub batch_size: Option<usize>,
    pub stall_threshold_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct BackgroundJobsConfig {
    pub staleness_report_interval_secs: Option<u64>,
    pub pattern_refresh_interval_secs: Option<u64>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}
