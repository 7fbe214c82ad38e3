//! Job orchestrator for reelforge
//!
//! Drives one job from intake to a terminal state: compatibility pass,
//! duration resolution, render, upload and status reporting, wrapped in a
//! bounded retry loop. Artifacts of every attempt are cleaned up whatever
//! the outcome.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::compat::{CodecCompatibilityPipeline, SourceRole, TranscodeDecision};
use crate::config::{Config, TranscodeConfig};
use crate::duration::{DurationResolver, MediaDurations};
use crate::job::{FailureDetail, Job, JobStatus};
use crate::layout::{RenderRequest, ValidationError};
use crate::probe::MediaProbe;
use crate::renderer::{RenderError, RenderSpec, Renderer};
use crate::status::{StatusSink, StatusUpdate};
use crate::storage::{Storage, StorageError};
use crate::tracker::ResourceTracker;
use crate::transcode::{RemoteTranscoder, TranscodeError};

/// Error type for a single job attempt
#[derive(Debug, Error)]
pub enum JobError {
    /// The request itself is unusable; retrying cannot help
    #[error("Invalid request: {0}")]
    Validation(#[from] ValidationError),

    /// A source could not be made renderable
    #[error("Failed to prepare {role} source: {source}")]
    Transcode {
        role: SourceRole,
        #[source]
        source: TranscodeError,
    },

    #[error("Render failed: {0}")]
    Render(#[from] RenderError),

    #[error("Upload failed: {0}")]
    Storage(#[from] StorageError),

    #[error("Failed to create output directory: {0}")]
    OutputDir(std::io::Error),
}

impl JobError {
    /// Terminal errors end the job without consuming retries.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobError::Validation(_))
    }

    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            JobError::Validation(_) => "validation",
            JobError::Transcode { .. } => "transcode",
            JobError::Render(RenderError::CompositionNotFound(_)) => "composition_not_found",
            JobError::Render(RenderError::Timeout(_)) => "render_timeout",
            JobError::Render(_) => "render",
            JobError::Storage(_) => "storage",
            JobError::OutputDir(_) => "output_dir",
        }
    }
}

/// A job that reached the Failed state.
#[derive(Debug, Error)]
#[error("job {} failed: {}", .job.id, .error)]
pub struct FailedJob {
    pub job: Job,
    #[source]
    pub error: JobError,
    /// What was written to the status store
    pub detail: FailureDetail,
}

/// Runs a job to a terminal state.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, job: Job) -> Result<Job, FailedJob>;
}

/// Tunables of the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub render_timeout: Duration,
    pub transcode_timeout: Duration,
    /// Upper bound on a single status write
    pub status_timeout: Duration,
    /// Directory rendered files are written to
    pub output_dir: PathBuf,
    pub transcode: TranscodeConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl OrchestratorConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_retries: config.queue.max_retries,
            render_timeout: config.timeouts.render(),
            transcode_timeout: config.timeouts.transcode(),
            status_timeout: config.timeouts.status(),
            output_dir: config.renderer.output_dir.clone(),
            transcode: config.transcode.clone(),
        }
    }
}

/// External services a job talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub probe: Arc<dyn MediaProbe>,
    pub transcoder: Arc<dyn RemoteTranscoder>,
    pub renderer: Arc<dyn Renderer>,
    pub storage: Arc<dyn Storage>,
    pub status: Arc<dyn StatusSink>,
}

/// File name of a job's rendered output.
///
/// Characters outside `[A-Za-z0-9_-]` in the id are replaced so the id can
/// never escape the output directory.
pub fn output_file_name(job_id: &str, millis: i64) -> String {
    let safe_id: String = job_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("video-{}-{}.mp4", safe_id, millis)
}

pub struct JobOrchestrator {
    collaborators: Collaborators,
    pipeline: CodecCompatibilityPipeline,
    config: OrchestratorConfig,
}

impl JobOrchestrator {
    pub fn new(collaborators: Collaborators, config: OrchestratorConfig) -> Self {
        let pipeline = CodecCompatibilityPipeline::new(
            collaborators.probe.clone(),
            collaborators.transcoder.clone(),
            collaborators.storage.clone(),
            &config.transcode,
            config.transcode_timeout,
        );
        Self {
            collaborators,
            pipeline,
            config,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Best-effort status write, abandoned after `status_timeout`.
    async fn report(&self, job_id: &str, update: &StatusUpdate) {
        let write = self.collaborators.status.set_status(job_id, update);
        match tokio::time::timeout(self.config.status_timeout, write).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(job_id = %job_id, status = %update.status(), error = %e, "Failed to write job status");
            }
            Err(_) => {
                warn!(
                    job_id = %job_id,
                    status = %update.status(),
                    timeout_secs = self.config.status_timeout.as_secs(),
                    "Status write timed out"
                );
            }
        }
    }

    async fn cleanup(&self, job_id: &str, tracker: &ResourceTracker) {
        let report = tracker.cleanup().await;
        if !report.is_clean() {
            warn!(
                job_id = %job_id,
                failed = report.errors.len(),
                "Some artifacts could not be removed"
            );
        }
        info!(
            job_id = %job_id,
            removed = report.removed.len(),
            already_absent = report.already_absent,
            "Cleanup finished"
        );
    }

    async fn prepare(
        &self,
        source_ref: Option<&str>,
        job_id: &str,
        role: SourceRole,
        tracker: &ResourceTracker,
    ) -> Result<TranscodeDecision, JobError> {
        self.pipeline
            .ensure_compatible(source_ref, job_id, role, tracker)
            .await
            .map_err(|source| JobError::Transcode { role, source })
    }

    async fn probe_duration(&self, decision: &TranscodeDecision) -> Option<f64> {
        match &decision.resolved_ref {
            Some(source_ref) => self.collaborators.probe.detect_duration(source_ref).await,
            None => None,
        }
    }

    /// One attempt. Returns the public URL of the uploaded render.
    async fn attempt(&self, job: &Job, tracker: &ResourceTracker) -> Result<String, JobError> {
        self.report(&job.id, &StatusUpdate::Processing).await;

        let request = RenderRequest::from_payload(&job.payload)?;
        info!(job_id = %job.id, layout = request.layout.name(), "Derived layout");

        // A primary failure aborts before the secondary is probed.
        let primary = self
            .prepare(request.primary_ref.as_deref(), &job.id, SourceRole::Primary, tracker)
            .await?;
        let secondary = if request.layout.uses_secondary() {
            self.prepare(request.secondary_ref.as_deref(), &job.id, SourceRole::Secondary, tracker)
                .await?
        } else {
            TranscodeDecision::absent()
        };

        let durations = MediaDurations::new(
            self.probe_duration(&primary).await,
            self.probe_duration(&secondary).await,
        );
        let duration_secs =
            DurationResolver::new(request.default_duration_secs).resolve(&request.layout, durations);
        info!(
            job_id = %job.id,
            primary = ?durations.primary,
            secondary = ?durations.secondary,
            duration_secs,
            "Resolved duration"
        );

        tokio::fs::create_dir_all(&self.config.output_dir)
            .await
            .map_err(JobError::OutputDir)?;
        let output_name = output_file_name(&job.id, chrono::Utc::now().timestamp_millis());
        let output_path = self.config.output_dir.join(&output_name);
        tracker.register_local(output_path.clone());

        let spec = RenderSpec::build(
            &request,
            primary.resolved_ref,
            secondary.resolved_ref,
            duration_secs,
            output_path,
        );

        let rendered = tokio::time::timeout(
            self.config.render_timeout,
            self.collaborators.renderer.render(&spec),
        )
        .await
        .map_err(|_| RenderError::Timeout(self.config.render_timeout))??;
        // the renderer may have written somewhere other than the requested path
        tracker.register_local(rendered.clone());

        let url = self.collaborators.storage.upload(&rendered, &output_name).await?;
        Ok(url)
    }
}

#[async_trait]
impl JobRunner for JobOrchestrator {
    async fn run(&self, mut job: Job) -> Result<Job, FailedJob> {
        let tracker = ResourceTracker::new(self.collaborators.storage.clone());

        loop {
            job.status = JobStatus::Processing;
            info!(job_id = %job.id, attempt = job.retry_count + 1, "Starting attempt");

            let outcome = self.attempt(&job, &tracker).await;

            match outcome {
                Ok(output_url) => {
                    self.report(
                        &job.id,
                        &StatusUpdate::Completed {
                            output_url: output_url.clone(),
                        },
                    )
                    .await;
                    self.cleanup(&job.id, &tracker).await;

                    info!(job_id = %job.id, output_url = %output_url, retries = job.retry_count, "Job completed");
                    job.status = JobStatus::Completed;
                    job.output_url = Some(output_url);
                    return Ok(job);
                }
                Err(error) => {
                    self.cleanup(&job.id, &tracker).await;

                    if !error.is_terminal() && job.retry_count < self.config.max_retries {
                        job.retry_count += 1;
                        warn!(
                            job_id = %job.id,
                            kind = error.kind(),
                            error = %error,
                            retry = job.retry_count,
                            max_retries = self.config.max_retries,
                            "Attempt failed, retrying"
                        );
                        continue;
                    }

                    let detail = FailureDetail::from_error(&error);
                    error!(
                        job_id = %job.id,
                        kind = error.kind(),
                        error = %error,
                        retries = job.retry_count,
                        "Job failed"
                    );
                    self.report(
                        &job.id,
                        &StatusUpdate::Failed {
                            detail: detail.clone(),
                        },
                    )
                    .await;

                    job.status = JobStatus::Failed;
                    return Err(FailedJob { job, error, detail });
                }
            }
        }
    }
}
