//! Per-run render configuration.
//!
//! [`RunConfiguration`] is supplied once at pipeline start and never
//! mutated afterwards. It is validated by [`RunConfiguration::validate`]
//! before any stage is launched.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::DeviceId;

/// Smallest upscale factor accepted by the upscaler.
pub const MIN_UPSCALE_FACTOR: u32 = 2;
/// Largest upscale factor accepted by the upscaler.
pub const MAX_UPSCALE_FACTOR: u32 = 4;

const DEFAULT_UPSCALE_FACTOR: u32 = 2;
const DEFAULT_FRAMERATE: u32 = 30;

/// Output resolution in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

/// Which compute device the accelerated stages should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DevicePreference {
    /// Pick the best-scoring device from the probe snapshot.
    #[default]
    Auto,
    /// Never use a GPU.
    Cpu,
    /// Use exactly this device.
    Device(DeviceId),
}

/// Denoiser backing the denoise stage. `None` skips the stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenoiseMethod {
    #[default]
    Oidn,
    Fastdvdnet,
    None,
}

/// Supported output video codecs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Codec {
    /// Apple ProRes 4444 with alpha (`prores_ks`, profile 4).
    #[default]
    ProresKs,
    /// QuickTime Animation (lossless RLE with alpha).
    Qtrle,
}

impl Codec {
    /// Encoder name as understood by ffmpeg.
    pub fn encoder_name(self) -> &'static str {
        match self {
            Self::ProresKs => "prores_ks",
            Self::Qtrle => "qtrle",
        }
    }
}

/// Immutable input to a single pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfiguration {
    /// Scene document handed to the renderer.
    pub scene_file: PathBuf,
    pub frame_start: u32,
    pub frame_end: u32,
    pub resolution: Resolution,
    pub sample_count: u32,
    #[serde(default)]
    pub device: DevicePreference,
    #[serde(default)]
    pub denoise: DenoiseMethod,
    #[serde(default)]
    pub upscale: bool,
    #[serde(default = "default_upscale_factor")]
    pub upscale_factor: u32,
    #[serde(default)]
    pub interpolate: bool,
    /// Every stage directory and the final video are created below this path.
    pub output_root: PathBuf,
    #[serde(default)]
    pub codec: Codec,
    #[serde(default = "default_framerate")]
    pub framerate: u32,
}

fn default_upscale_factor() -> u32 {
    DEFAULT_UPSCALE_FACTOR
}

fn default_framerate() -> u32 {
    DEFAULT_FRAMERATE
}

impl RunConfiguration {
    /// Number of frames in the inclusive range `frame_start..=frame_end`.
    ///
    /// Only meaningful on a validated configuration.
    pub fn frame_count(&self) -> u32 {
        self.frame_end.saturating_sub(self.frame_start) + 1
    }

    /// Check every field invariant. Nothing is launched for a configuration
    /// that fails here.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.frame_end < self.frame_start {
            return Err(CoreError::Configuration(format!(
                "frame_end ({}) must be >= frame_start ({})",
                self.frame_end, self.frame_start
            )));
        }
        if self.frame_end - self.frame_start == u32::MAX {
            return Err(CoreError::Configuration(format!(
                "frame range {}..={} holds more than {} frames",
                self.frame_start,
                self.frame_end,
                u32::MAX
            )));
        }
        if self.resolution.width == 0 || self.resolution.height == 0 {
            return Err(CoreError::Configuration(format!(
                "resolution must be positive, got {}x{}",
                self.resolution.width, self.resolution.height
            )));
        }
        if self.sample_count == 0 {
            return Err(CoreError::Configuration(
                "sample_count must be greater than 0".to_string(),
            ));
        }
        if self.framerate == 0 {
            return Err(CoreError::Configuration(
                "framerate must be greater than 0".to_string(),
            ));
        }
        if self.upscale
            && !(MIN_UPSCALE_FACTOR..=MAX_UPSCALE_FACTOR).contains(&self.upscale_factor)
        {
            return Err(CoreError::Configuration(format!(
                "upscale_factor must be between {MIN_UPSCALE_FACTOR} and {MAX_UPSCALE_FACTOR}, got {}",
                self.upscale_factor
            )));
        }
        if self.output_root.as_os_str().is_empty() {
            return Err(CoreError::Configuration(
                "output_root must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Derive the single-frame, reduced-sample configuration used by
    /// estimate mode. Optional post-processing stages are disabled.
    pub fn single_frame_probe(&self, reduced_samples: u32, output_root: PathBuf) -> Self {
        Self {
            frame_end: self.frame_start,
            sample_count: reduced_samples.min(self.sample_count).max(1),
            denoise: DenoiseMethod::None,
            upscale: false,
            interpolate: false,
            output_root,
            ..self.clone()
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
