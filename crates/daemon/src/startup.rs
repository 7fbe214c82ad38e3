//! Startup checks module for reelforge
//!
//! Provides preflight checks run before the queue accepts work:
//! - ffprobe availability (codec and duration detection)
//! - Renderer program availability
//! - Output directory writability

use crate::config::Config;
use std::path::Path;
use std::process::Command;
use thiserror::Error;
use tracing::{info, warn};

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("ffprobe not available: {0}")]
    FfprobeUnavailable(String),

    #[error("Renderer not available: {0}")]
    RendererUnavailable(String),

    #[error("Output directory {path} is not usable: {source}")]
    OutputDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Parse the version out of `ffprobe -version` output.
///
/// Handles release builds ("ffprobe version 6.1.1 ...") and git builds
/// prefixed with `n` ("ffprobe version n7.0-12-g...").
pub fn parse_ffprobe_version(version_output: &str) -> Option<String> {
    let version_line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains("ffprobe version"))?;

    let version = version_line
        .to_lowercase()
        .split("ffprobe version")
        .nth(1)?
        .split_whitespace()
        .next()?
        .trim_start_matches('n')
        .to_string();

    if version.starts_with(|c: char| c.is_ascii_digit()) {
        Some(version)
    } else {
        None
    }
}

/// Check that `ffprobe -version` runs.
pub fn check_ffprobe_available(program: &str) -> Result<String, StartupError> {
    let output = Command::new(program).arg("-version").output().map_err(|e| {
        StartupError::FfprobeUnavailable(format!(
            "{} -version failed; is FFmpeg installed and in PATH? Error: {}",
            program, e
        ))
    })?;

    if !output.status.success() {
        return Err(StartupError::FfprobeUnavailable(format!(
            "{} -version exited with {}",
            program, output.status
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(parse_ffprobe_version(&stdout).unwrap_or_else(|| "unknown".to_string()))
}

/// Check that the renderer program can be started.
pub fn check_renderer_available(program: &str) -> Result<(), StartupError> {
    let output = Command::new(program).arg("--version").output().map_err(|e| {
        StartupError::RendererUnavailable(format!(
            "{} --version failed; is it installed and in PATH? Error: {}",
            program, e
        ))
    })?;

    if !output.status.success() {
        return Err(StartupError::RendererUnavailable(format!(
            "{} --version exited with {}",
            program, output.status
        )));
    }

    Ok(())
}

/// Create the output directory if needed and make sure it accepts files.
pub fn check_output_dir(dir: &Path) -> Result<(), StartupError> {
    let wrap = |source: std::io::Error| StartupError::OutputDir {
        path: dir.display().to_string(),
        source,
    };

    std::fs::create_dir_all(dir).map_err(wrap)?;
    let probe = dir.join(".reelforge-write-check");
    std::fs::write(&probe, b"").map_err(wrap)?;
    std::fs::remove_file(&probe).map_err(wrap)?;
    Ok(())
}

/// Run all startup checks in order: output dir, ffprobe, renderer.
///
/// A missing transcoder endpoint or status store is only reported; jobs
/// that need them fail and retry on their own.
pub fn run_startup_checks(cfg: &Config) -> Result<(), StartupError> {
    check_output_dir(&cfg.renderer.output_dir)?;

    let version = check_ffprobe_available("ffprobe")?;
    info!(version = %version, "ffprobe available");

    check_renderer_available(&cfg.renderer.program)?;
    info!(program = %cfg.renderer.program, "Renderer available");

    if cfg.transcode.endpoint.is_none() {
        warn!("No transcoder endpoint configured; incompatible sources will fail");
    }
    if cfg.status.rest_url.is_none() {
        warn!("No status store configured; status transitions are only logged");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_ffprobe_version_parsing(
            major in 1u32..20,
            minor in 0u32..10,
            n_prefix in any::<bool>(),
        ) {
            let prefix = if n_prefix { "n" } else { "" };
            let output = format!(
                "ffprobe version {}{}.{} Copyright (c) 2007-2024 the FFmpeg developers\nbuilt with gcc 13",
                prefix, major, minor
            );
            let expected = format!("{}.{}", major, minor);
            prop_assert_eq!(parse_ffprobe_version(&output), Some(expected));
        }
    }

    #[test]
    fn test_parse_ffprobe_version_git_build() {
        let output = "ffprobe version n7.0-12-gabc123 Copyright (c) the FFmpeg developers";
        assert_eq!(parse_ffprobe_version(output).as_deref(), Some("7.0-12-gabc123"));
    }

    #[test]
    fn test_parse_ffprobe_version_invalid() {
        assert_eq!(parse_ffprobe_version("command not found"), None);
        assert_eq!(parse_ffprobe_version("ffprobe version"), None);
        assert_eq!(parse_ffprobe_version("ffprobe version git-master"), None);
    }

    #[test]
    fn test_missing_programs() {
        assert!(matches!(
            check_ffprobe_available("/nonexistent/ffprobe"),
            Err(StartupError::FfprobeUnavailable(_))
        ));
        assert!(matches!(
            check_renderer_available("/nonexistent/render-composition"),
            Err(StartupError::RendererUnavailable(_))
        ));
    }

    #[test]
    fn test_check_output_dir_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("nested").join("out");

        check_output_dir(&out).unwrap();

        assert!(out.is_dir());
        assert_eq!(std::fs::read_dir(&out).unwrap().count(), 0);
    }

    #[test]
    fn test_check_output_dir_rejects_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("taken");
        std::fs::write(&file, b"x").unwrap();

        assert!(matches!(
            check_output_dir(&file),
            Err(StartupError::OutputDir { .. })
        ));
    }
}
