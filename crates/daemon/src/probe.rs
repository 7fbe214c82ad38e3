//! Media probing via ffprobe.
//!
//! Provides the [`MediaProbe`] seam used by the compatibility pipeline and the
//! orchestrator, plus an ffprobe-backed implementation.

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

/// Error type for probe operations.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// ffprobe command failed to execute.
    #[error("ffprobe failed: {0}")]
    FfprobeFailed(String),

    /// Failed to parse ffprobe JSON output.
    #[error("Failed to parse ffprobe output: {0}")]
    ParseError(String),

    /// The source has no video stream.
    #[error("no video stream found")]
    NoVideoStream,

    /// IO error during probe.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Inspects media sources.
#[async_trait]
pub trait MediaProbe: Send + Sync {
    /// Lowercased codec name of the first video stream.
    async fn detect_codec(&self, source_ref: &str) -> Result<String, ProbeError>;

    /// Container duration in seconds. Any failure yields `None`.
    async fn detect_duration(&self, source_ref: &str) -> Option<f64>;
}

/// Raw ffprobe JSON structures for parsing.
mod ffprobe_json {
    use super::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub codec_name: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub duration: Option<String>,
    }
}

/// [`MediaProbe`] backed by the ffprobe binary.
///
/// Accepts local paths and http(s) URLs, whatever ffprobe itself can open.
#[derive(Debug, Clone)]
pub struct FfprobeProbe {
    program: String,
}

impl Default for FfprobeProbe {
    fn default() -> Self {
        Self {
            program: "ffprobe".to_string(),
        }
    }
}

impl FfprobeProbe {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn run(&self, entries: &str, source_ref: &str) -> Result<String, ProbeError> {
        let output = Command::new(&self.program)
            .args([
                "-v",
                "error",
                "-select_streams",
                "v:0",
                "-show_entries",
                entries,
                "-of",
                "json",
            ])
            .arg(source_ref)
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProbeError::FfprobeFailed(format!(
                "ffprobe exited with status {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl MediaProbe for FfprobeProbe {
    async fn detect_codec(&self, source_ref: &str) -> Result<String, ProbeError> {
        let stdout = self.run("stream=codec_name", source_ref).await?;
        let codec = parse_codec_output(&stdout)?;
        debug!(source = %source_ref, codec = %codec, "Detected source codec");
        Ok(codec)
    }

    async fn detect_duration(&self, source_ref: &str) -> Option<f64> {
        match self.run("format=duration", source_ref).await {
            Ok(stdout) => parse_duration_output(&stdout),
            Err(e) => {
                warn!(source = %source_ref, error = %e, "Could not detect duration");
                None
            }
        }
    }
}

/// Parses the codec of the first video stream from ffprobe JSON output.
pub fn parse_codec_output(json_str: &str) -> Result<String, ProbeError> {
    let ffprobe: ffprobe_json::FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| ProbeError::ParseError(e.to_string()))?;

    ffprobe
        .streams
        .unwrap_or_default()
        .into_iter()
        .find_map(|s| s.codec_name)
        .map(|c| c.trim().to_lowercase())
        .filter(|c| !c.is_empty())
        .ok_or(ProbeError::NoVideoStream)
}

/// Parses the container duration from ffprobe JSON output.
///
/// Returns `None` for missing, unparsable, non-finite or non-positive values.
pub fn parse_duration_output(json_str: &str) -> Option<f64> {
    let ffprobe: ffprobe_json::FfprobeOutput = serde_json::from_str(json_str).ok()?;

    ffprobe
        .format?
        .duration?
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|d| d.is_finite() && *d > 0.0)
}
