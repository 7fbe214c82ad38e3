//! Job model for render requests.
//!
//! A job is one logical "generate a video" request. Its identity is the id of
//! the record in the status store, which stays the same across retries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::error::Error as StdError;

/// Externally observable state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Job is waiting for a render slot.
    Queued,
    /// An attempt is running (possibly a retry).
    Processing,
    /// Output rendered and uploaded.
    Completed,
    /// Retries exhausted or a terminal error occurred.
    Failed,
}

impl Default for JobStatus {
    fn default() -> Self {
        Self::Queued
    }
}

impl JobStatus {
    /// Convert status to the string stored in the status table
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// Whether the job has settled.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Composition fields of a request record.
///
/// Stored as a JSON column named `remotion` on the request table.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CompositionFields {
    /// Title text drawn over the video.
    #[serde(default)]
    pub caption: Option<String>,
    /// Primary (background) video reference.
    #[serde(default)]
    pub template: Option<String>,
    /// Secondary (foreground/demo) video reference.
    #[serde(default)]
    pub demo: Option<String>,
    /// Audio track reference.
    #[serde(default)]
    pub sound: Option<String>,
    /// Seconds to skip into the audio track.
    #[serde(default)]
    pub audio_offset: Option<f64>,
    /// Requested duration, used when no source defines the timeline.
    #[serde(default)]
    pub duration: Option<f64>,
}

/// Structured request payload as delivered by intake.
///
/// Unknown fields of the source record are ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JobPayload {
    #[serde(default, rename = "remotion")]
    pub composition: Option<CompositionFields>,
    /// Title position: top, center or bottom.
    #[serde(default)]
    pub text_alignment: Option<String>,
    /// Split-screen arrangement, e.g. "left-right".
    #[serde(default)]
    pub video_alignment: Option<String>,
    /// Explicit layout: single, split or sequential.
    #[serde(default)]
    pub layout: Option<String>,
}

impl JobPayload {
    /// Composition fields, or an empty set when the column is null.
    pub fn composition(&self) -> CompositionFields {
        self.composition.clone().unwrap_or_default()
    }
}

/// A render job owned by the orchestrator for the duration of its run.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    /// Stable identifier shared with the status store
    pub id: String,
    /// Request payload
    pub payload: JobPayload,
    /// Current state
    pub status: JobStatus,
    /// Number of retries performed so far
    pub retry_count: u32,
    /// When the job entered this process
    pub created_at: DateTime<Utc>,
    /// Public URL of the uploaded output once completed
    pub output_url: Option<String>,
}

impl Job {
    /// Create a new queued job
    pub fn new(id: impl Into<String>, payload: JobPayload) -> Self {
        Self {
            id: id.into(),
            payload,
            status: JobStatus::Queued,
            retry_count: 0,
            created_at: Utc::now(),
            output_url: None,
        }
    }
}

/// Error details persisted with a failed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureDetail {
    /// Top-level error message
    pub message: String,
    /// Messages of the error's source chain, outermost first
    pub trace: Vec<String>,
    /// When the failure was recorded
    pub timestamp: DateTime<Utc>,
}

impl FailureDetail {
    /// Capture message and source chain of an error.
    pub fn from_error(error: &(dyn StdError + 'static)) -> Self {
        let mut trace = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            trace.push(cause.to_string());
            source = cause.source();
        }

        Self {
            message: error.to_string(),
            trace,
            timestamp: Utc::now(),
        }
    }
}
