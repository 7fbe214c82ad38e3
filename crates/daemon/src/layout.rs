//! Layout derivation and request validation.
//!
//! Turns a raw [`JobPayload`] into a validated [`RenderRequest`]. Every error
//! produced here is a configuration problem that a retry cannot fix.

use crate::duration::DEFAULT_DURATION_SECS;
use crate::job::JobPayload;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

/// Default title when the request carries none.
pub const DEFAULT_TITLE: &str = "Default Title";

/// Error type for invalid request configuration.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("invalid split position '{0}': must be one of left-right, right-left, top-bottom, bottom-top")]
    InvalidSplitPosition(String),

    #[error("invalid text position '{0}': must be one of top, center, bottom")]
    InvalidTextPosition(String),

    #[error("unknown layout '{0}': must be one of single, split, sequential")]
    UnknownLayout(String),

    #[error("{0} layout requires a secondary video source")]
    MissingSecondarySource(&'static str),

    #[error("audio offset must be a finite non-negative number of seconds, got {0}")]
    InvalidAudioOffset(f64),

    #[error("requested duration must be a finite positive number of seconds, got {0}")]
    InvalidDuration(f64),
}

/// Arrangement of the two sources in split-screen mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SplitPosition {
    LeftRight,
    RightLeft,
    TopBottom,
    BottomTop,
}

impl SplitPosition {
    pub fn as_str(&self) -> &'static str {
        match self {
            SplitPosition::LeftRight => "left-right",
            SplitPosition::RightLeft => "right-left",
            SplitPosition::TopBottom => "top-bottom",
            SplitPosition::BottomTop => "bottom-top",
        }
    }
}

impl Default for SplitPosition {
    fn default() -> Self {
        Self::LeftRight
    }
}

impl FromStr for SplitPosition {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "left-right" => Ok(SplitPosition::LeftRight),
            "right-left" => Ok(SplitPosition::RightLeft),
            "top-bottom" => Ok(SplitPosition::TopBottom),
            "bottom-top" => Ok(SplitPosition::BottomTop),
            _ => Err(ValidationError::InvalidSplitPosition(s.to_string())),
        }
    }
}

/// Vertical placement of the title text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextPosition {
    Top,
    Center,
    Bottom,
}

impl Default for TextPosition {
    fn default() -> Self {
        Self::Bottom
    }
}

impl FromStr for TextPosition {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "top" => Ok(TextPosition::Top),
            "center" => Ok(TextPosition::Center),
            "bottom" => Ok(TextPosition::Bottom),
            _ => Err(ValidationError::InvalidTextPosition(s.to_string())),
        }
    }
}

/// How the primary and secondary sources are composed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum LayoutMode {
    /// One background source.
    Single,
    /// Both sources side by side (or stacked).
    SplitScreen { position: SplitPosition },
    /// Primary then secondary, concatenated in time.
    Sequential,
}

impl LayoutMode {
    /// Whether the layout consumes the secondary source.
    pub fn uses_secondary(&self) -> bool {
        !matches!(self, LayoutMode::Single)
    }

    pub fn name(&self) -> &'static str {
        match self {
            LayoutMode::Single => "single",
            LayoutMode::SplitScreen { .. } => "split",
            LayoutMode::Sequential => "sequential",
        }
    }
}

/// Validated, normalized request ready for the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderRequest {
    pub title: String,
    pub text_position: TextPosition,
    pub layout: LayoutMode,
    pub primary_ref: Option<String>,
    pub secondary_ref: Option<String>,
    pub audio_ref: Option<String>,
    pub audio_offset_secs: f64,
    /// Timeline length used when no source duration is known
    pub default_duration_secs: f64,
}

/// Treat empty or whitespace-only references as absent.
fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Derive the layout mode from a payload.
///
/// Without an explicit `layout` the request is split-screen when it has a
/// secondary source and single otherwise.
pub fn derive_layout(payload: &JobPayload) -> Result<LayoutMode, ValidationError> {
    let has_secondary = non_empty(payload.composition().demo.as_deref()).is_some();

    let requested = payload
        .layout
        .as_deref()
        .map(|l| l.trim().to_lowercase())
        .filter(|l| !l.is_empty());

    let split_position = || -> Result<SplitPosition, ValidationError> {
        match non_empty(payload.video_alignment.as_deref()) {
            Some(raw) => raw.parse(),
            None => Ok(SplitPosition::default()),
        }
    };

    let layout = match requested.as_deref() {
        None if has_secondary => LayoutMode::SplitScreen {
            position: split_position()?,
        },
        None | Some("single") => LayoutMode::Single,
        Some("split") | Some("split-screen") | Some("split_screen") => LayoutMode::SplitScreen {
            position: split_position()?,
        },
        Some("sequential") => LayoutMode::Sequential,
        Some(_) => {
            return Err(ValidationError::UnknownLayout(
                payload.layout.clone().unwrap_or_default(),
            ))
        }
    };

    if layout.uses_secondary() && !has_secondary {
        return Err(ValidationError::MissingSecondarySource(layout.name()));
    }

    Ok(layout)
}

impl RenderRequest {
    /// Derive the layout and validate every layout-specific invariant.
    pub fn from_payload(payload: &JobPayload) -> Result<Self, ValidationError> {
        let layout = derive_layout(payload)?;
        let composition = payload.composition();

        let text_position = match non_empty(payload.text_alignment.as_deref()) {
            Some(raw) => raw.parse()?,
            None => TextPosition::default(),
        };

        let audio_offset_secs = composition.audio_offset.unwrap_or(0.0);
        if !audio_offset_secs.is_finite() || audio_offset_secs < 0.0 {
            return Err(ValidationError::InvalidAudioOffset(audio_offset_secs));
        }

        let default_duration_secs = match composition.duration {
            Some(d) if d.is_finite() && d > 0.0 => d,
            Some(d) => return Err(ValidationError::InvalidDuration(d)),
            None => DEFAULT_DURATION_SECS,
        };

        let secondary_ref = if layout.uses_secondary() {
            non_empty(composition.demo.as_deref())
        } else {
            None
        };

        Ok(Self {
            title: non_empty(composition.caption.as_deref())
                .unwrap_or_else(|| DEFAULT_TITLE.to_string()),
            text_position,
            layout,
            primary_ref: non_empty(composition.template.as_deref()),
            secondary_ref,
            audio_ref: non_empty(composition.sound.as_deref()),
            audio_offset_secs,
            default_duration_secs,
        })
    }
}
