//! HTTP client for the code host permission endpoints.

use super::{CodeHostClient, SyncFailure};
use crate::permission_jobs::PermissionSyncJob;
use anyhow::{Context, Result};
use serde::Serialize;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::debug;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SyncBody {
    invalidate_caches: bool,
}

pub struct HttpCodeHostClient {
    client: reqwest::Client,
    base_url: String,
    runtime: Handle,
}

impl HttpCodeHostClient {
    /// `runtime` drives the requests; calls must come from outside its worker
    /// threads (e.g. from `spawn_blocking`).
    pub fn new(base_url: String, timeout_sec: u64, runtime: Handle) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_sec))
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = base_url.trim_end_matches('/').to_string();

        Ok(Self {
            client,
            base_url,
            runtime,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn post_json<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> Result<(), SyncFailure> {
        let url = format!("{}{}", self.base_url, path);
        debug!("POST {}", url);
        self.runtime.block_on(async {
            let response = self
                .client
                .post(&url)
                .json(body)
                .send()
                .await
                .map_err(|e| classify_transport_error(&url, e))?;

            let status = response.status();
            if status.is_success() {
                return Ok(());
            }
            let text = response.text().await.unwrap_or_default();
            Err(classify_status(status, &url, &text))
        })
    }
}

fn classify_transport_error(url: &str, err: reqwest::Error) -> SyncFailure {
    // Anything that never produced a response is worth retrying
    let retryable = err.is_connect() || err.is_timeout() || err.is_request();
    SyncFailure {
        message: format!("request to {} failed: {}", url, err),
        retryable,
    }
}

fn classify_status(status: reqwest::StatusCode, url: &str, body: &str) -> SyncFailure {
    let message = if body.is_empty() {
        format!("{} returned {}", url, status)
    } else {
        format!("{} returned {}: {}", url, status, body.trim())
    };
    SyncFailure {
        message,
        retryable: status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS,
    }
}

impl CodeHostClient for HttpCodeHostClient {
    fn apply_project_permissions(&self, job: &PermissionSyncJob) -> Result<(), SyncFailure> {
        self.post_json(
            &format!(
                "/permissions/projects/{}/{}",
                job.external_service_id, job.project_key
            ),
            job,
        )
    }

    fn sync_repository_permissions(&self, repository_id: i64) -> Result<(), SyncFailure> {
        self.post_json(
            &format!("/permissions/repositories/{}/sync", repository_id),
            &SyncBody {
                invalidate_caches: false,
            },
        )
    }

    fn sync_user_permissions(&self, user_id: i64, invalidate_caches: bool) -> Result<(), SyncFailure> {
        self.post_json(
            &format!("/permissions/users/{}/sync", user_id),
            &SyncBody { invalidate_caches },
        )
    }
}
