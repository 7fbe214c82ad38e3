//! Composition renderer.
//!
//! A [`RenderSpec`] is plain data. [`CommandRenderer`] hands it as
//! JSON to an external composition program, which writes the finished video
//! to the requested output path.

use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use crate::layout::{LayoutMode, RenderRequest, TextPosition};

/// Composition rendered for every job.
pub const COMPOSITION_ID: &str = "VideoComposition";
pub const FPS: u32 = 30;
pub const WIDTH: u32 = 1080;
pub const HEIGHT: u32 = 1920;
/// Audio bed volume relative to the video sources.
pub const AUDIO_VOLUME: f64 = 0.25;

/// Exit code the composition program uses for an unknown composition.
const EXIT_COMPOSITION_NOT_FOUND: i32 = 3;

/// Error type for render operations
#[derive(Debug, Error)]
pub enum RenderError {
    /// The composition program does not know the composition
    #[error("Composition not found: {0}")]
    CompositionNotFound(String),

    /// Rendering exceeded the configured limit
    #[error("Render timed out after {0:?}")]
    Timeout(Duration),

    /// Renderer exited with a non-zero status
    #[error("Renderer failed with exit code {code:?}: {stderr}")]
    Failed { code: Option<i32>, stderr: String },

    /// IO error while running the renderer
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The spec could not be encoded
    #[error("Failed to encode render spec: {0}")]
    Spec(#[from] serde_json::Error),

    /// Renderer reported success but wrote nothing
    #[error("Renderer produced no output at {0}")]
    MissingOutput(PathBuf),
}

/// Background audio of the composition.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioTrack {
    pub source_ref: String,
    pub offset_secs: f64,
    pub volume: f64,
}

/// Declarative description of one render.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderSpec {
    pub composition_id: String,
    pub title: String,
    pub text_position: TextPosition,
    pub layout: LayoutMode,
    pub primary_ref: Option<String>,
    pub secondary_ref: Option<String>,
    pub audio: Option<AudioTrack>,
    pub duration_secs: f64,
    pub fps: u32,
    pub width: u32,
    pub height: u32,
    pub duration_in_frames: u64,
    #[serde(skip)]
    pub output_path: PathBuf,
}

/// Whole frames covering `duration_secs`, at least one.
pub fn frames_for(duration_secs: f64, fps: u32) -> u64 {
    let frames = (duration_secs * f64::from(fps)).floor();
    if frames.is_finite() && frames >= 1.0 {
        frames as u64
    } else {
        1
    }
}

impl RenderSpec {
    /// Build from a validated request and the resolved sources of this attempt.
    pub fn build(
        request: &RenderRequest,
        primary_ref: Option<String>,
        secondary_ref: Option<String>,
        duration_secs: f64,
        output_path: PathBuf,
    ) -> Self {
        let audio = request.audio_ref.as_ref().map(|source_ref| AudioTrack {
            source_ref: source_ref.clone(),
            offset_secs: request.audio_offset_secs,
            volume: AUDIO_VOLUME,
        });

        Self {
            composition_id: COMPOSITION_ID.to_string(),
            title: request.title.clone(),
            text_position: request.text_position,
            layout: request.layout,
            primary_ref,
            secondary_ref,
            audio,
            duration_secs,
            fps: FPS,
            width: WIDTH,
            height: HEIGHT,
            duration_in_frames: frames_for(duration_secs, FPS),
            output_path,
        }
    }
}

/// Renders a [`RenderSpec`] to a local file.
#[async_trait]
pub trait Renderer: Send + Sync {
    /// Render and return the path of the written file.
    async fn render(&self, spec: &RenderSpec) -> Result<PathBuf, RenderError>;
}

/// [`Renderer`] that shells out to a composition program.
#[derive(Debug, Clone)]
pub struct CommandRenderer {
    program: String,
    args: Vec<String>,
}

impl CommandRenderer {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

/// Build the renderer invocation.
///
/// The spec itself is written to stdin, so the command line only carries
/// the configured extra arguments, `--spec -` and the output path.
pub fn build_render_command(program: &str, args: &[String], output_path: &Path) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd.arg("--spec").arg("-");
    cmd.arg("--output").arg(output_path);
    cmd
}

/// Classify a failed renderer exit.
fn classify_failure(composition_id: &str, code: Option<i32>, stderr: &str) -> RenderError {
    if code == Some(EXIT_COMPOSITION_NOT_FOUND)
        || stderr.to_lowercase().contains("composition not found")
    {
        RenderError::CompositionNotFound(composition_id.to_string())
    } else {
        RenderError::Failed {
            code,
            stderr: stderr.trim().to_string(),
        }
    }
}

#[async_trait]
impl Renderer for CommandRenderer {
    async fn render(&self, spec: &RenderSpec) -> Result<PathBuf, RenderError> {
        let payload = serde_json::to_vec(spec)?;

        if let Some(parent) = spec.output_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let mut cmd = build_render_command(&self.program, &self.args, &spec.output_path);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(
            program = %self.program,
            output = %spec.output_path.display(),
            frames = spec.duration_in_frames,
            "Starting renderer"
        );
        let mut child = cmd.spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&payload).await?;
            stdin.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_failure(
                &spec.composition_id,
                output.status.code(),
                &stderr,
            ));
        }

        if !tokio::fs::try_exists(&spec.output_path).await? {
            return Err(RenderError::MissingOutput(spec.output_path.clone()));
        }

        info!(output = %spec.output_path.display(), "Render finished");
        Ok(spec.output_path.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::SplitPosition;

    fn request() -> RenderRequest {
        RenderRequest {
            title: "Launch day".to_string(),
            text_position: TextPosition::Top,
            layout: LayoutMode::SplitScreen {
                position: SplitPosition::RightLeft,
            },
            primary_ref: Some("bg.mp4".to_string()),
            secondary_ref: Some("demo.mov".to_string()),
            audio_ref: Some("track.mp3".to_string()),
            audio_offset_secs: 4.0,
            default_duration_secs: 10.0,
        }
    }

    fn get_command_args(cmd: &Command) -> Vec<String> {
        cmd.as_std()
            .get_args()
            .filter_map(|arg| arg.to_str().map(String::from))
            .collect()
    }

    #[test]
    fn test_frames_for() {
        assert_eq!(frames_for(12.0, 30), 360);
        assert_eq!(frames_for(10.51, 30), 315);
        assert_eq!(frames_for(0.01, 30), 1);
        assert_eq!(frames_for(f64::NAN, 30), 1);
    }

    #[test]
    fn test_build_spec() {
        let spec = RenderSpec::build(
            &request(),
            Some("https://bucket/output/1-primary.mp4".to_string()),
            Some("demo.mov".to_string()),
            12.0,
            PathBuf::from("out/video-1.mp4"),
        );

        assert_eq!(spec.composition_id, COMPOSITION_ID);
        assert_eq!(spec.primary_ref.as_deref(), Some("https://bucket/output/1-primary.mp4"));
        assert_eq!(spec.duration_in_frames, 360);
        assert_eq!((spec.width, spec.height, spec.fps), (1080, 1920, 30));

        let audio = spec.audio.unwrap();
        assert_eq!(audio.offset_secs, 4.0);
        assert_eq!(audio.volume, AUDIO_VOLUME);
    }

    #[test]
    fn test_spec_json_shape() {
        let spec = RenderSpec::build(&request(), None, None, 10.0, PathBuf::from("x.mp4"));
        let json = serde_json::to_value(&spec).unwrap();

        assert_eq!(json["compositionId"], COMPOSITION_ID);
        assert_eq!(json["textPosition"], "top");
        assert_eq!(json["layout"]["mode"], "split_screen");
        assert_eq!(json["layout"]["position"], "right-left");
        assert_eq!(json["audio"]["sourceRef"], "track.mp3");
        assert_eq!(json["durationInFrames"], 300);
        assert!(json.get("outputPath").is_none());
    }

    #[test]
    fn test_build_render_command() {
        let cmd = build_render_command(
            "render-composition",
            &["--concurrency".to_string(), "4".to_string()],
            Path::new("out/video-1.mp4"),
        );
        let args = get_command_args(&cmd);

        assert_eq!(cmd.as_std().get_program(), "render-composition");
        assert_eq!(
            args,
            vec!["--concurrency", "4", "--spec", "-", "--output", "out/video-1.mp4"]
        );
    }

    #[test]
    fn test_classify_failure() {
        assert!(matches!(
            classify_failure("VideoComposition", Some(3), ""),
            RenderError::CompositionNotFound(id) if id == "VideoComposition"
        ));
        assert!(matches!(
            classify_failure("VideoComposition", Some(1), "Error: Composition not found in bundle"),
            RenderError::CompositionNotFound(_)
        ));
        assert!(matches!(
            classify_failure("VideoComposition", Some(1), "  out of memory \n"),
            RenderError::Failed { code: Some(1), stderr } if stderr == "out of memory"
        ));
    }

    #[tokio::test]
    async fn test_missing_program_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = CommandRenderer::new("/nonexistent/render-composition", Vec::new());
        let spec = RenderSpec::build(&request(), None, None, 10.0, dir.path().join("v.mp4"));

        assert!(matches!(renderer.render(&spec).await, Err(RenderError::Io(_))));
    }
}
