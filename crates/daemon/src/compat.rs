//! Codec compatibility pipeline.
//!
//! The renderer cannot decode every codec it may be handed. Each source is
//! probed; sources on the deny-list (or that cannot be probed at all) are
//! staged into the bucket and sent through the remote transcoder, and the
//! rendition replaces the original reference for the rest of the attempt.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::TranscodeConfig;
use crate::probe::MediaProbe;
use crate::storage::{file_extension, Storage};
use crate::tracker::ResourceTracker;
use crate::transcode::{RemoteTranscoder, TranscodeError, TranscodeJob, TranscodeProfile};

/// Which input of the composition a source feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceRole {
    Primary,
    Secondary,
}

impl SourceRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceRole::Primary => "primary",
            SourceRole::Secondary => "secondary",
        }
    }
}

impl fmt::Display for SourceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of the compatibility check for one source.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TranscodeDecision {
    /// Reference as supplied by the request
    pub source_ref: Option<String>,
    pub needs_transcode: bool,
    /// Reference the renderer should read
    pub resolved_ref: Option<String>,
    /// Bucket key of the transcoded rendition, when one was produced
    pub remote_artifact_key: Option<String>,
    /// Codec reported by the probe, if it succeeded
    pub detected_codec: Option<String>,
}

impl TranscodeDecision {
    /// Decision for an absent source.
    pub fn absent() -> Self {
        Self::default()
    }

    fn passthrough(source_ref: &str, codec: String) -> Self {
        Self {
            source_ref: Some(source_ref.to_string()),
            needs_transcode: false,
            resolved_ref: Some(source_ref.to_string()),
            remote_artifact_key: None,
            detected_codec: Some(codec),
        }
    }
}

/// Which codecs must be transcoded before rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompatibilityPolicy {
    deny_codecs: Vec<String>,
}

impl Default for CompatibilityPolicy {
    fn default() -> Self {
        Self::new(["hevc", "h265"])
    }
}

impl CompatibilityPolicy {
    pub fn new<I, S>(deny_codecs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            deny_codecs: deny_codecs
                .into_iter()
                .map(|c| c.as_ref().trim().to_lowercase())
                .filter(|c| !c.is_empty())
                .collect(),
        }
    }

    /// Whether a probed codec needs transcoding.
    pub fn requires_transcode(&self, codec: &str) -> bool {
        let codec = codec.trim().to_lowercase();
        self.deny_codecs.iter().any(|denied| *denied == codec)
    }
}

/// Object key for a pipeline artifact: `{prefix}{job_id}-{role}-{millis}.{ext}`.
pub fn artifact_key(prefix: &str, job_id: &str, role: SourceRole, millis: i64, ext: &str) -> String {
    format!("{}{}-{}-{}.{}", prefix, job_id, role, millis, ext)
}

/// Probes sources and transcodes the ones the renderer cannot read.
pub struct CodecCompatibilityPipeline {
    probe: Arc<dyn MediaProbe>,
    transcoder: Arc<dyn RemoteTranscoder>,
    storage: Arc<dyn Storage>,
    policy: CompatibilityPolicy,
    profile: TranscodeProfile,
    input_prefix: String,
    output_prefix: String,
    timeout: Duration,
}

impl CodecCompatibilityPipeline {
    pub fn new(
        probe: Arc<dyn MediaProbe>,
        transcoder: Arc<dyn RemoteTranscoder>,
        storage: Arc<dyn Storage>,
        config: &TranscodeConfig,
        timeout: Duration,
    ) -> Self {
        Self {
            probe,
            transcoder,
            storage,
            policy: CompatibilityPolicy::new(&config.deny_codecs),
            profile: TranscodeProfile::from(config),
            input_prefix: config.input_prefix.clone(),
            output_prefix: config.output_prefix.clone(),
            timeout,
        }
    }

    pub fn policy(&self) -> &CompatibilityPolicy {
        &self.policy
    }

    /// Make one source renderable.
    ///
    /// Every bucket object created on the way is registered with `tracker`
    /// before the call that creates it, so a failure part-way through still
    /// leaves a complete manifest. Transcoder failures propagate; the
    /// original reference is never used as a silent fallback.
    pub async fn ensure_compatible(
        &self,
        source_ref: Option<&str>,
        job_id: &str,
        role: SourceRole,
        tracker: &ResourceTracker,
    ) -> Result<TranscodeDecision, TranscodeError> {
        let source_ref = match source_ref.map(str::trim).filter(|s| !s.is_empty()) {
            Some(s) => s,
            None => return Ok(TranscodeDecision::absent()),
        };

        let detected_codec = match self.probe.detect_codec(source_ref).await {
            Ok(codec) if !self.policy.requires_transcode(&codec) => {
                info!(job_id = %job_id, role = %role, codec = %codec, "Source is compatible");
                return Ok(TranscodeDecision::passthrough(source_ref, codec));
            }
            Ok(codec) => {
                info!(job_id = %job_id, role = %role, codec = %codec, "Source codec requires transcoding");
                Some(codec)
            }
            Err(e) => {
                warn!(job_id = %job_id, role = %role, error = %e, "Codec probe failed, transcoding to be safe");
                None
            }
        };

        let millis = chrono::Utc::now().timestamp_millis();
        let job = TranscodeJob {
            bucket: self.storage.bucket().to_string(),
            input_key: artifact_key(&self.input_prefix, job_id, role, millis, &file_extension(source_ref)),
            output_key: artifact_key(&self.output_prefix, job_id, role, millis, "mp4"),
            profile: self.profile.clone(),
        };

        let output_key = tokio::time::timeout(self.timeout, self.stage_and_transcode(source_ref, &job, tracker))
            .await
            .map_err(|_| TranscodeError::Timeout(self.timeout))??;

        Ok(TranscodeDecision {
            source_ref: Some(source_ref.to_string()),
            needs_transcode: true,
            resolved_ref: Some(self.storage.object_url(&output_key)),
            remote_artifact_key: Some(output_key),
            detected_codec,
        })
    }

    async fn stage_and_transcode(
        &self,
        source_ref: &str,
        job: &TranscodeJob,
        tracker: &ResourceTracker,
    ) -> Result<String, TranscodeError> {
        tracker.register_remote(job.input_key.as_str());
        self.storage.stage(source_ref, &job.input_key).await?;

        tracker.register_remote(job.output_key.as_str());
        let output_key = self.transcoder.transcode(job).await?;
        if output_key != job.output_key {
            tracker.register_remote(output_key.as_str());
        }

        Ok(output_key)
    }
}
