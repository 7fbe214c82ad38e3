//! Status reporting back to the request store.
//!
//! Status writes are best-effort: the orchestrator logs a failed write and
//! carries on, so a flaky store never changes a job's outcome.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{StatusConfig, TimeoutConfig};
use crate::http::build_client;
use crate::job::{FailureDetail, JobStatus};

/// Error type for status writes
#[derive(Debug, Error)]
pub enum StatusError {
    #[error("Status request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Status store returned HTTP {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// A status transition to persist.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusUpdate {
    Processing,
    Completed { output_url: String },
    Failed { detail: FailureDetail },
}

impl StatusUpdate {
    pub fn status(&self) -> JobStatus {
        match self {
            StatusUpdate::Processing => JobStatus::Processing,
            StatusUpdate::Completed { .. } => JobStatus::Completed,
            StatusUpdate::Failed { .. } => JobStatus::Failed,
        }
    }

    /// Column values written for this transition.
    ///
    /// Completion clears any error left by an earlier attempt.
    pub fn row_patch(&self) -> Value {
        match self {
            StatusUpdate::Processing => json!({
                "status": JobStatus::Processing.as_str(),
            }),
            StatusUpdate::Completed { output_url } => json!({
                "status": JobStatus::Completed.as_str(),
                "remotion_video": output_url,
                "error": Value::Null,
                "completed_at": Utc::now().to_rfc3339(),
            }),
            StatusUpdate::Failed { detail } => json!({
                "status": JobStatus::Failed.as_str(),
                "error": detail,
            }),
        }
    }
}

/// Persists job status transitions.
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn set_status(&self, job_id: &str, update: &StatusUpdate) -> Result<(), StatusError>;
}

/// PostgREST-style sink: `PATCH {rest_url}/{table}?id=eq.{job_id}`.
#[derive(Debug, Clone)]
pub struct RestStatusSink {
    client: reqwest::Client,
    rest_url: String,
    table: String,
    api_key: Option<String>,
}

impl RestStatusSink {
    /// Each write is bounded by the `status` and `connect` timeouts.
    pub fn new(
        rest_url: impl Into<String>,
        table: impl Into<String>,
        api_key: Option<String>,
        timeouts: &TimeoutConfig,
    ) -> reqwest::Result<Self> {
        Ok(Self {
            client: build_client(timeouts.status(), timeouts.connect())?,
            rest_url: rest_url.into().trim_end_matches('/').to_string(),
            table: table.into(),
            api_key,
        })
    }

    /// Row URL for a job.
    pub fn row_url(&self, job_id: &str) -> String {
        format!(
            "{}/{}?id=eq.{}",
            self.rest_url,
            self.table,
            urlencoding::encode(job_id)
        )
    }
}

#[async_trait]
impl StatusSink for RestStatusSink {
    async fn set_status(&self, job_id: &str, update: &StatusUpdate) -> Result<(), StatusError> {
        let mut request = self
            .client
            .patch(self.row_url(job_id))
            .header("Prefer", "return=minimal")
            .json(&update.row_patch());

        if let Some(key) = &self.api_key {
            request = request.header("apikey", key).bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StatusError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        debug!(job_id = %job_id, status = %update.status(), "Status written");
        Ok(())
    }
}

/// Sink used when no status store is configured; transitions are only logged.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogStatusSink;

#[async_trait]
impl StatusSink for LogStatusSink {
    async fn set_status(&self, job_id: &str, update: &StatusUpdate) -> Result<(), StatusError> {
        match update {
            StatusUpdate::Processing => info!(job_id = %job_id, "Job processing"),
            StatusUpdate::Completed { output_url } => {
                info!(job_id = %job_id, output_url = %output_url, "Job completed")
            }
            StatusUpdate::Failed { detail } => {
                warn!(job_id = %job_id, error = %detail.message, "Job failed")
            }
        }
        Ok(())
    }
}

/// Pick the sink for a configuration.
pub fn sink_from_config(
    config: &StatusConfig,
    timeouts: &TimeoutConfig,
) -> reqwest::Result<std::sync::Arc<dyn StatusSink>> {
    match &config.rest_url {
        Some(url) if !url.trim().is_empty() => Ok(std::sync::Arc::new(RestStatusSink::new(
            url.as_str(),
            config.table.as_str(),
            config.api_key.clone(),
            timeouts,
        )?)),
        _ => Ok(std::sync::Arc::new(LogStatusSink)),
    }
}
