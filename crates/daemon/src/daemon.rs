//! Daemon startup and main loop for reelforge
//!
//! Wires configuration, collaborators, the render queue, the HTTP surface
//! and intake together, and runs until a shutdown signal arrives.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::{Config, ConfigError};
use crate::intake::run_line_feed;
use crate::job::Job;
use crate::orchestrator::{Collaborators, JobOrchestrator, JobRunner, OrchestratorConfig};
use crate::probe::FfprobeProbe;
use crate::queue::{QueueError, QueueSettings, RenderQueue, ShutdownOutcome};
use crate::renderer::CommandRenderer;
use crate::server::{run_server, AppState, ServerError};
use crate::startup::{run_startup_checks, StartupError};
use crate::status::sink_from_config;
use crate::storage::S3Storage;
use crate::transcode::{DisabledTranscoder, HttpTranscoder, RemoteTranscoder};

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Startup check failed
    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    /// HTTP server error
    #[error("Server error: {0}")]
    Server(#[from] ServerError),

    /// A directly invoked job did not complete
    #[error("{0}")]
    Job(#[from] QueueError),

    #[error("Failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

/// Build the production collaborators from configuration.
pub async fn build_collaborators(config: &Config) -> Result<Collaborators, DaemonError> {
    let timeouts = &config.timeouts;
    let transcoder: Arc<dyn RemoteTranscoder> = match &config.transcode.endpoint {
        Some(endpoint) if !endpoint.trim().is_empty() => {
            Arc::new(HttpTranscoder::new(endpoint.as_str(), timeouts)?)
        }
        _ => Arc::new(DisabledTranscoder),
    };

    Ok(Collaborators {
        probe: Arc::new(FfprobeProbe::default()),
        transcoder,
        renderer: Arc::new(CommandRenderer::new(
            config.renderer.program.as_str(),
            config.renderer.args.clone(),
        )),
        storage: Arc::new(S3Storage::new(&config.storage, timeouts).await?),
        status: sink_from_config(&config.status, timeouts)?,
    })
}

/// Daemon state containing all runtime components
pub struct Daemon {
    /// Configuration loaded from file and environment
    pub config: Config,
    queue: Arc<RenderQueue>,
}

impl Daemon {
    /// Initialize the daemon with production collaborators.
    ///
    /// Startup checks are run unless `skip_checks` is set.
    pub async fn new(config: Config, skip_checks: bool) -> Result<Self, DaemonError> {
        if skip_checks {
            warn!("Skipping startup checks");
        } else {
            run_startup_checks(&config)?;
        }

        let collaborators = build_collaborators(&config).await?;
        let orchestrator = JobOrchestrator::new(collaborators, OrchestratorConfig::from_config(&config));
        Ok(Self::with_runner(config, Arc::new(orchestrator)))
    }

    /// Initialize the daemon around an existing runner.
    ///
    /// Useful for testing when external tools are not available.
    pub fn with_runner(config: Config, runner: Arc<dyn JobRunner>) -> Self {
        let queue = Arc::new(RenderQueue::new(
            runner,
            QueueSettings::from_config(&config.queue),
        ));
        Self { config, queue }
    }

    /// Handle to the render queue
    pub fn queue(&self) -> Arc<RenderQueue> {
        self.queue.clone()
    }

    /// Run a single job to completion (direct invocation).
    pub async fn run_job(&self, job: Job) -> Result<Job, DaemonError> {
        let handle = self.queue.enqueue(job)?;
        Ok(handle.wait().await?)
    }

    /// Run the daemon until a shutdown signal arrives.
    ///
    /// Starts the HTTP server and health monitor, and, with `stdin_feed`,
    /// reads newline-delimited change-feed events from stdin. On shutdown
    /// the queue stops admitting and in-flight jobs get the configured grace
    /// period.
    pub async fn run(&self, stdin_feed: bool) -> Result<ShutdownOutcome, DaemonError> {
        let (stop_tx, stop_rx) = watch::channel(false);

        let monitor = self
            .queue
            .spawn_health_monitor(Duration::from_secs(self.config.queue.health_probe_interval_secs));

        let state = AppState::new(self.queue.clone(), self.config.status.table.clone());
        let bind = self.config.server.bind.clone();
        let mut server_stop = stop_rx.clone();
        let mut server = tokio::spawn(async move {
            run_server(&bind, state, async move {
                let _ = server_stop.changed().await;
            })
            .await
        });

        let feed = stdin_feed.then(|| {
            let queue = self.queue.clone();
            let table = self.config.status.table.clone();
            let mut feed_stop = stop_rx.clone();
            tokio::spawn(async move {
                let stdin = tokio::io::BufReader::new(tokio::io::stdin());
                tokio::select! {
                    result = run_line_feed(stdin, queue, &table) => {
                        if let Err(e) = result {
                            error!(error = %e, "Reading the intake feed failed");
                        }
                    }
                    _ = feed_stop.changed() => {}
                }
            })
        });

        let mut server_error = None;
        tokio::select! {
            _ = shutdown_signal() => info!("Shutdown signal received"),
            result = &mut server => {
                match result {
                    Ok(Ok(())) => warn!("HTTP server stopped unexpectedly"),
                    Ok(Err(e)) => server_error = Some(e),
                    Err(e) => error!(error = %e, "HTTP server task panicked"),
                }
            }
        }

        let _ = stop_tx.send(true);
        let outcome = self
            .queue
            .shutdown(Duration::from_secs(self.config.queue.shutdown_grace_secs))
            .await;

        if let Some(feed) = feed {
            feed.abort();
        }
        monitor.abort();
        if !server.is_finished() {
            let _ = server.await;
        }

        match server_error {
            Some(e) => Err(e.into()),
            None => {
                info!(outcome = ?outcome, "Daemon stopped");
                Ok(outcome)
            }
        }
    }
}

/// Resolves on ctrl-c or, on unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::job::{FailureDetail, JobPayload, JobStatus};
    use crate::layout::ValidationError;
    use crate::orchestrator::{FailedJob, JobError};
    use async_trait::async_trait;

    struct EchoRunner;

    #[async_trait]
    impl JobRunner for EchoRunner {
        async fn run(&self, mut job: Job) -> Result<Job, FailedJob> {
            if job.id == "invalid" {
                let error = JobError::Validation(ValidationError::MissingSecondarySource("split"));
                let detail = FailureDetail::from_error(&error);
                job.status = JobStatus::Failed;
                return Err(FailedJob { job, error, detail });
            }
            job.status = JobStatus::Completed;
            job.output_url = Some(format!("https://cdn.example.com/{}.mp4", job.id));
            Ok(job)
        }
    }

    fn create_test_config() -> Config {
        Config {
            queue: QueueConfig {
                concurrency: 3,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_daemon_uses_configured_concurrency() {
        let daemon = Daemon::with_runner(create_test_config(), Arc::new(EchoRunner));

        let status = daemon.queue().status();
        assert_eq!(status.concurrency_limit, 3);
        assert_eq!(status.queue_length, 0);
        assert!(status.healthy);
    }

    #[tokio::test]
    async fn test_run_job_completes() {
        let daemon = Daemon::with_runner(create_test_config(), Arc::new(EchoRunner));

        let job = daemon
            .run_job(Job::new("job-1", JobPayload::default()))
            .await
            .unwrap();

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.output_url.as_deref(), Some("https://cdn.example.com/job-1.mp4"));
        assert_eq!(daemon.queue().status().completed_jobs, 1);
    }

    #[tokio::test]
    async fn test_run_job_failure_is_reported() {
        let daemon = Daemon::with_runner(create_test_config(), Arc::new(EchoRunner));

        let err = daemon
            .run_job(Job::new("invalid", JobPayload::default()))
            .await
            .unwrap_err();

        assert!(matches!(err, DaemonError::Job(QueueError::Failed(_))));
        assert!(err.to_string().contains("invalid"));
    }

    #[tokio::test]
    async fn test_run_job_after_shutdown() {
        let daemon = Daemon::with_runner(create_test_config(), Arc::new(EchoRunner));
        daemon.queue().shutdown(Duration::from_secs(1)).await;

        let err = daemon
            .run_job(Job::new("late", JobPayload::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, DaemonError::Job(QueueError::ShuttingDown)));
    }
}
