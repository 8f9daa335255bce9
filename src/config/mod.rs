mod file_config;

pub use file_config::{
    BackgroundJobsConfig, FileConfig, PermissionJobsConfig, ScanConfig, SyncRequestsConfig,
};

use crate::permission_jobs::RetryPolicy;
use crate::scan::ScanOptions;
use anyhow::{bail, Result};
use std::path::PathBuf;
use std::time::Duration;

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub db_path: Option<PathBuf>,
    pub metrics_port: u16,
    pub busy_timeout_ms: u64,
    pub code_host_url: Option<String>,
    pub code_host_timeout_sec: u64,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    // Core settings
    pub db_path: PathBuf,
    pub metrics_port: u16,
    pub busy_timeout: Duration,
    pub code_host_url: Option<String>,
    pub code_host_timeout_sec: u64,

    // Feature configs (with defaults)
    pub index_scan: ScanSettings,
    pub retention_scan: ScanSettings,
    pub permission_jobs: PermissionJobSettings,
    pub sync_requests: SyncRequestSettings,
    pub background_jobs: BackgroundJobsSettings,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let db_path = file
            .db_path
            .map(PathBuf::from)
            .or_else(|| cli.db_path.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("db_path must be specified via --db-path or in config file")
            })?;
        if db_path.is_dir() {
            bail!("db_path is a directory: {:?}", db_path);
        }

        let metrics_port = file.metrics_port.unwrap_or(cli.metrics_port);
        let busy_timeout =
            Duration::from_millis(file.busy_timeout_ms.unwrap_or(cli.busy_timeout_ms));
        let code_host_url = file
            .code_host_url
            .clone()
            .or_else(|| cli.code_host_url.clone());
        let code_host_timeout_sec = file
            .code_host_timeout_sec
            .unwrap_or(cli.code_host_timeout_sec);

        let index_scan = ScanSettings::resolve(
            "index_scan",
            file.index_scan.unwrap_or_default(),
            ScanSettings::index_defaults(),
        )?;
        let retention_scan = ScanSettings::resolve(
            "retention_scan",
            file.retention_scan.unwrap_or_default(),
            ScanSettings::retention_defaults(),
        )?;

        let pj_file = file.permission_jobs.unwrap_or_default();
        let pj_default = PermissionJobSettings::default();
        let permission_jobs = PermissionJobSettings {
            poll_interval_secs: pj_file
                .poll_interval_secs
                .unwrap_or(pj_default.poll_interval_secs),
            batch_size: pj_file.batch_size.unwrap_or(pj_default.batch_size),
            max_resets: pj_file.max_resets.unwrap_or(pj_default.max_resets),
            initial_backoff_secs: pj_file
                .initial_backoff_secs
                .unwrap_or(pj_default.initial_backoff_secs),
            max_backoff_secs: pj_file
                .max_backoff_secs
                .unwrap_or(pj_default.max_backoff_secs),
            backoff_multiplier: pj_file
                .backoff_multiplier
                .unwrap_or(pj_default.backoff_multiplier),
            stall_threshold_secs: pj_file
                .stall_threshold_secs
                .unwrap_or(pj_default.stall_threshold_secs),
            stall_check_interval_secs: pj_file
                .stall_check_interval_secs
                .unwrap_or(pj_default.stall_check_interval_secs),
        };
        if permission_jobs.backoff_multiplier < 1.0 {
            bail!(
                "permission_jobs.backoff_multiplier must be at least 1.0, got {}",
                permission_jobs.backoff_multiplier
            );
        }
        if permission_jobs.max_resets < 0 {
            bail!("permission_jobs.max_resets must not be negative");
        }
        if permission_jobs.initial_backoff_secs == 0 {
            bail!("permission_jobs.initial_backoff_secs must be greater than zero");
        }
        if permission_jobs.max_backoff_secs < permission_jobs.initial_backoff_secs {
            bail!(
                "permission_jobs.max_backoff_secs ({}) must not be below initial_backoff_secs ({})",
                permission_jobs.max_backoff_secs,
                permission_jobs.initial_backoff_secs
            );
        }
        // A zero threshold would reset every lease the moment it is taken
        if permission_jobs.stall_threshold_secs == 0 {
            bail!("permission_jobs.stall_threshold_secs must be greater than zero");
        }

        let sr_file = file.sync_requests.unwrap_or_default();
        let sr_default = SyncRequestSettings::default();
        let sync_requests = SyncRequestSettings {
            poll_interval_secs: sr_file
                .poll_interval_secs
                .unwrap_or(sr_default.poll_interval_secs),
            batch_size: sr_file.batch_size.unwrap_or(sr_default.batch_size),
            stall_threshold_secs: sr_file
                .stall_threshold_secs
                .unwrap_or(sr_default.stall_threshold_secs),
        };
        if sync_requests.stall_threshold_secs == 0 {
            bail!("sync_requests.stall_threshold_secs must be greater than zero");
        }

        let bj_file = file.background_jobs.unwrap_or_default();
        let bj_default = BackgroundJobsSettings::default();
        let background_jobs = BackgroundJobsSettings {
            staleness_report_interval_secs: bj_file
                .staleness_report_interval_secs
                .unwrap_or(bj_default.staleness_report_interval_secs),
            pattern_refresh_interval_secs: bj_file
                .pattern_refresh_interval_secs
                .unwrap_or(bj_default.pattern_refresh_interval_secs),
        };

        Ok(Self {
            db_path,
            metrics_port,
            busy_timeout,
            code_host_url,
            code_host_timeout_sec,
            index_scan,
            retention_scan,
            permission_jobs,
            sync_requests,
            background_jobs,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScanSettings {
    pub interval_secs: u64,
    pub process_delay_secs: u64,
    pub limit: usize,
    pub allow_global_policies: bool,
    pub repository_match_limit: Option<usize>,
}

impl ScanSettings {
    pub fn index_defaults() -> Self {
        Self {
            interval_secs: 60,
            process_delay_secs: 24 * 3600,
            limit: 100,
            allow_global_policies: false,
            repository_match_limit: None,
        }
    }

    pub fn retention_defaults() -> Self {
        Self {
            interval_secs: 300,
            process_delay_secs: 24 * 3600,
            limit: 50,
            allow_global_policies: false,
            repository_match_limit: None,
        }
    }

    fn resolve(section: &str, file: ScanConfig, defaults: Self) -> Result<Self> {
        let settings = Self {
            interval_secs: file.interval_secs.unwrap_or(defaults.interval_secs),
            process_delay_secs: file
                .process_delay_secs
                .unwrap_or(defaults.process_delay_secs),
            limit: file.limit.unwrap_or(defaults.limit),
            allow_global_policies: file
                .allow_global_policies
                .unwrap_or(defaults.allow_global_policies),
            repository_match_limit: file.repository_match_limit.or(defaults.repository_match_limit),
        };
        if settings.limit == 0 {
            bail!("{}.limit must be greater than zero", section);
        }
        if settings.process_delay_secs == 0 {
            bail!("{}.process_delay_secs must be greater than zero", section);
        }
        if settings.interval_secs == 0 {
            bail!("{}.interval_secs must be greater than zero", section);
        }
        Ok(settings)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn scan_options(&self) -> ScanOptions {
        ScanOptions {
            process_delay: Duration::from_secs(self.process_delay_secs),
            limit: self.limit,
            allow_global_policies: self.allow_global_policies,
            repository_match_limit: self.repository_match_limit,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PermissionJobSettings {
    pub poll_interval_secs: u64,
    pub batch_size: usize,
    pub max_resets: i64,
    pub initial_backoff_secs: u64,
    pub max_backoff_secs: u64,
    pub backoff_multiplier: f64,
    pub stall_threshold_secs: u64,
    pub stall_check_interval_secs: u64,
}

impl PermissionJobSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_resets: self.max_resets,
            initial_backoff_secs: self.initial_backoff_secs,
            max_backoff_secs: self.max_backoff_secs,
            backoff_multiplier: self.backoff_multiplier,
        }
    }

    pub fn stall_threshold(&self) -> Duration {
        Duration::from_secs(self.stall_threshold_secs)
    }
}

impl Default for PermissionJobSettings {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            poll_interval_secs: 5,
            batch_size: 10,
            max_resets: retry.max_resets,
            initial_backoff_secs: retry.initial_backoff_secs,
            max_backoff_secs: retry.max_backoff_secs,
            backoff_multiplier: retry.backoff_multiplier,
            stall_threshold_secs: 600,
            stall_check_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncRequestSettings {
    pub poll_interval_secs: u64,
    pub batch_size: usize,
    pub stall_threshold_secs: u64,
}

impl SyncRequestSettings {
    pub fn stall_threshold(&self) -> Duration {
        Duration::from_secs(self.stall_threshold_secs)
    }
}

impl Default for SyncRequestSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: 2,
            batch_size: 20,
            stall_threshold_secs: 600,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackgroundJobsSettings {
    pub staleness_report_interval_secs: u64,
    pub pattern_refresh_interval_secs: u64,
}

impl Default for BackgroundJobsSettings {
    fn default() -> Self {
        Self {
            staleness_report_interval_secs: 30,
            pattern_refresh_interval_secs: 15 * 60,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli() -> CliConfig {
        CliConfig {
            db_path: Some(PathBuf::from("/tmp/upkeep-test.db")),
            metrics_port: 9091,
            busy_timeout_ms: 5000,
            code_host_url: Some("http://codehost:7080".to_string()),
            code_host_timeout_sec: 30,
        }
    }

    #[test]
    fn test_resolve_cli_only() {
        let config = AppConfig::resolve(&cli(), None).unwrap();

        assert_eq!(config.db_path, PathBuf::from("/tmp/upkeep-test.db"));
        assert_eq!(config.metrics_port, 9091);
        assert_eq!(config.busy_timeout, Duration::from_secs(5));
        assert_eq!(config.code_host_url.as_deref(), Some("http://codehost:7080"));
        assert_eq!(config.code_host_timeout_sec, 30);
        assert_eq!(config.index_scan, ScanSettings::index_defaults());
        assert_eq!(config.retention_scan, ScanSettings::retention_defaults());
        assert_eq!(config.permission_jobs, PermissionJobSettings::default());
        assert_eq!(config.sync_requests, SyncRequestSettings::default());
    }

    #[test]
    fn test_resolve_toml_overrides_cli() {
        let file_config = FileConfig {
            db_path: Some("/toml/upkeep.db".to_string()),
            metrics_port: Some(9500),
            index_scan: Some(ScanConfig {
                limit: Some(7),
                repository_match_limit: Some(3),
                ..Default::default()
            }),
            permission_jobs: Some(PermissionJobsConfig {
                max_resets: Some(2),
                ..Default::default()
            }),
            ..Default::default()
        };

        let config = AppConfig::resolve(&cli(), Some(file_config)).unwrap();

        // TOML values should override CLI
        assert_eq!(config.db_path, PathBuf::from("/toml/upkeep.db"));
        assert_eq!(config.metrics_port, 9500);
        assert_eq!(config.index_scan.limit, 7);
        assert_eq!(config.index_scan.repository_match_limit, Some(3));
        // Unset fields keep their defaults
        assert_eq!(config.index_scan.interval_secs, 60);
        assert_eq!(config.permission_jobs.retry_policy().max_resets, 2);
        // CLI value used when TOML doesn't specify
        assert_eq!(config.code_host_timeout_sec, 30);
    }

    #[test]
    fn test_scan_options_from_settings() {
        let options = ScanSettings::retention_defaults().scan_options();
        assert_eq!(options.process_delay, Duration::from_secs(86400));
        assert_eq!(options.limit, 50);
        assert!(!options.allow_global_policies);
    }

    #[test]
    fn test_resolve_missing_db_path_error() {
        let result = AppConfig::resolve(&CliConfig::default(), None);
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("db_path must be specified"));
    }

    #[test]
    fn test_resolve_db_path_is_directory_error() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let cli = CliConfig {
            db_path: Some(temp_dir.path().to_path_buf()),
            ..Default::default()
        };
        let result = AppConfig::resolve(&cli, None);
        assert!(result.unwrap_err().to_string().contains("is a directory"));
    }

    #[test]
    fn test_resolve_rejects_zero_scan_limit_and_delay() {
        let file_config = FileConfig {
            retention_scan: Some(ScanConfig {
                limit: Some(0),
                ..Default::default()
            }),
            ..Default::default()
        };
        let err = AppConfig::resolve(&cli(), Some(file_config)).unwrap_err();
        assert!(err.to_string().contains("retention_scan.limit"));

        let file_config = FileConfig {
            index_scan: Some(ScanConfig {
                process_delay_secs: Some(0),
                ..Default::default()
            }),
            ..Default::default()
        };
        let err = AppConfig::resolve(&cli(), Some(file_config)).unwrap_err();
        assert!(err.to_string().contains("index_scan.process_delay_secs"));
    }

    #[test]
    fn test_resolve_rejects_shrinking_backoff() {
        let file_config = FileConfig {
            permission_jobs: Some(PermissionJobsConfig {
                backoff_multiplier: Some(0.5),
                ..Default::default()
            }),
            ..Default::default()
        };
        let err = AppConfig::resolve(&cli(), Some(file_config)).unwrap_err();
        assert!(err.to_string().contains("backoff_multiplier"));
    }

    #[test]
    fn test_resolve_rejects_zero_initial_backoff() {
        let file_config = FileConfig {
            permission_jobs: Some(PermissionJobsConfig {
                initial_backoff_secs: Some(0),
                ..Default::default()
            }),
            ..Default::default()
        };
        let err = AppConfig::resolve(&cli(), Some(file_config)).unwrap_err();
        assert!(err.to_string().contains("initial_backoff_secs"));
    }

    #[test]
    fn test_resolve_rejects_max_backoff_below_initial() {
        let file_config = FileConfig {
            permission_jobs: Some(PermissionJobsConfig {
                initial_backoff_secs: Some(120),
                max_backoff_secs: Some(60),
                ..Default::default()
            }),
            ..Default::default()
        };
        let err = AppConfig::resolve(&cli(), Some(file_config)).unwrap_err();
        assert!(err.to_string().contains("max_backoff_secs"));

        let file_config = FileConfig {
            permission_jobs: Some(PermissionJobsConfig {
                initial_backoff_secs: Some(120),
                max_backoff_secs: Some(120),
                ..Default::default()
            }),
            ..Default::default()
        };
        let config = AppConfig::resolve(&cli(), Some(file_config)).unwrap();
        assert_eq!(config.permission_jobs.retry_policy().max_backoff_secs, 120);
    }

    #[test]
    fn test_resolve_rejects_zero_stall_thresholds() {
        let file_config = FileConfig {
            permission_jobs: Some(PermissionJobsConfig {
                stall_threshold_secs: Some(0),
                ..Default::default()
            }),
            ..Default::default()
        };
        let err = AppConfig::resolve(&cli(), Some(file_config)).unwrap_err();
        assert!(err
            .to_string()
            .contains("permission_jobs.stall_threshold_secs"));

        let file_config = FileConfig {
            sync_requests: Some(SyncRequestsConfig {
                stall_threshold_secs: Some(0),
                ..Default::default()
            }),
            ..Default::default()
        };
        let err = AppConfig::resolve(&cli(), Some(file_config)).unwrap_err();
        assert!(err.to_string().contains("sync_requests.stall_threshold_secs"));
    }
}
