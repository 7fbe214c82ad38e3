//! reelforge
//!
//! Render orchestration service: turns "generate a video" requests into
//! finished, uploaded media files while coordinating a composition renderer,
//! a remote transcoder, object storage and a status store.

pub mod compat;
pub mod daemon;
pub mod duration;
pub mod http;
pub mod intake;
pub mod job;
pub mod layout;
pub mod logging;
pub mod metrics;
pub mod orchestrator;
pub mod probe;
pub mod queue;
pub mod renderer;
pub mod server;
pub mod startup;
pub mod status;
pub mod storage;
pub mod tracker;
pub mod transcode;

pub use reelforge_config as config;
pub use reelforge_config::Config;
pub use compat::{CodecCompatibilityPipeline, CompatibilityPolicy, SourceRole, TranscodeDecision};
pub use daemon::{build_collaborators, Daemon, DaemonError};
pub use duration::{resolve_duration, DurationResolver, MediaDurations, DEFAULT_DURATION_SECS};
pub use http::build_client;
pub use intake::{job_from_document, parse_event, run_line_feed, IntakeError, IntakeEvent};
pub use job::{FailureDetail, Job, JobPayload, JobStatus};
pub use layout::{derive_layout, LayoutMode, RenderRequest, SplitPosition, TextPosition, ValidationError};
pub use logging::{build_subscriber, init_logging};
pub use metrics::{collect_memory_metrics, MetricsSnapshot};
pub use orchestrator::{Collaborators, FailedJob, JobError, JobOrchestrator, JobRunner, OrchestratorConfig};
pub use probe::{FfprobeProbe, MediaProbe, ProbeError};
pub use queue::{JobHandle, QueueError, QueueSettings, QueueStatus, RenderQueue, ShutdownOutcome};
pub use renderer::{CommandRenderer, RenderError, RenderSpec, Renderer};
pub use server::{create_router, run_server, AppState, ServerError};
pub use startup::{run_startup_checks, StartupError};
pub use status::{LogStatusSink, RestStatusSink, StatusError, StatusSink, StatusUpdate};
pub use storage::{S3Storage, Storage, StorageError};
pub use tracker::{CleanupError, CleanupManifest, CleanupReport, ResourceKind, ResourceTracker};
pub use transcode::{HttpTranscoder, RemoteTranscoder, TranscodeError, TranscodeProfile};
