//! Timeline length resolution.
//!
//! Derives the final output duration from the probed source durations and the
//! layout mode. Pure and deterministic; no I/O.

use crate::layout::LayoutMode;

/// Timeline length when neither the request nor the sources define one.
pub const DEFAULT_DURATION_SECS: f64 = 10.0;

/// Probed durations of the two sources. `None` means unknown.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MediaDurations {
    pub primary: Option<f64>,
    pub secondary: Option<f64>,
}

impl MediaDurations {
    /// Build from raw probe values, discarding anything that is not a usable length.
    pub fn new(primary: Option<f64>, secondary: Option<f64>) -> Self {
        Self {
            primary: known(primary),
            secondary: known(secondary),
        }
    }
}

/// A duration is known only if it is finite and positive.
fn known(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite() && *v > 0.0)
}

/// Resolves the final timeline length of a render.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DurationResolver {
    default_secs: f64,
}

impl Default for DurationResolver {
    fn default() -> Self {
        Self {
            default_secs: DEFAULT_DURATION_SECS,
        }
    }
}

impl DurationResolver {
    /// Create a resolver with a custom fallback length.
    ///
    /// An unusable fallback is replaced by [`DEFAULT_DURATION_SECS`].
    pub fn new(default_secs: f64) -> Self {
        Self {
            default_secs: known(Some(default_secs)).unwrap_or(DEFAULT_DURATION_SECS),
        }
    }

    pub fn default_secs(&self) -> f64 {
        self.default_secs
    }

    /// Resolve the final duration in seconds.
    ///
    /// - Single: primary, else the fallback.
    /// - SplitScreen: secondary (it drives attention), else primary, else the fallback.
    /// - Sequential: primary + secondary, else whichever is known, else the fallback.
    pub fn resolve(&self, layout: &LayoutMode, durations: MediaDurations) -> f64 {
        let MediaDurations { primary, secondary } = MediaDurations::new(durations.primary, durations.secondary);

        match layout {
            LayoutMode::Single => primary.unwrap_or(self.default_secs),
            LayoutMode::SplitScreen { .. } => secondary.or(primary).unwrap_or(self.default_secs),
            LayoutMode::Sequential => match (primary, secondary) {
                (Some(p), Some(s)) => p + s,
                (Some(known), None) | (None, Some(known)) => known,
                (None, None) => self.default_secs,
            },
        }
    }
}

/// Resolve with the default fallback length.
pub fn resolve_duration(layout: &LayoutMode, primary: Option<f64>, secondary: Option<f64>) -> f64 {
    DurationResolver::default().resolve(layout, MediaDurations::new(primary, secondary))
}
