//! Render-time estimation from a single reduced-quality test frame.
//!
//! The estimate is a linear extrapolation: render time is assumed to scale
//! proportionally with the sample count and with the number of frames.
//! Fixed per-invocation overhead (renderer start-up, scene load, shader
//! compilation) is measured once in the test frame and then multiplied
//! like everything else, so long sequences are usually over-estimated.

use std::time::Duration;

use serde::Serialize;

use crate::error::CoreError;

/// Sample count used for the test frame unless overridden.
pub const DEFAULT_ESTIMATE_SAMPLES: u32 = 32;

/// Seconds per hour (3600.0).
pub const SECS_PER_HOUR: f64 = 3600.0;

/// Result of an estimate invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderEstimate {
    /// Wall-clock time of the single test frame.
    pub test_seconds: f64,
    pub reduced_samples: u32,
    pub requested_samples: u32,
    pub frame_count: u32,
    pub seconds_per_frame: f64,
    pub total_seconds: f64,
    pub total_hours: f64,
}

/// Sample count for the test frame: the requested count, capped at
/// `limit`, never below 1.
pub fn reduced_sample_count(requested: u32, limit: u32) -> u32 {
    requested.min(limit).max(1)
}

/// Linearly extrapolate a full-run duration from one measured frame.
///
/// `total = measured * (requested_samples / reduced_samples) * frame_count`
pub fn extrapolate(
    measured: Duration,
    reduced_samples: u32,
    requested_samples: u32,
    frame_count: u32,
) -> Result<RenderEstimate, CoreError> {
    if reduced_samples == 0 {
        return Err(CoreError::Validation(
            "reduced sample count must be greater than 0".to_string(),
        ));
    }
    let test_seconds = measured.as_secs_f64();
    let sample_ratio = f64::from(requested_samples) / f64::from(reduced_samples);
    let seconds_per_frame = test_seconds * sample_ratio;
    let total_seconds = seconds_per_frame * f64::from(frame_count);
    Ok(RenderEstimate {
        test_seconds,
        reduced_samples,
        requested_samples,
        frame_count,
        seconds_per_frame,
        total_seconds,
        total_hours: total_seconds / SECS_PER_HOUR,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scales_by_samples_and_frames() {
        let estimate = extrapolate(Duration::from_secs(10), 32, 128, 250).expect("estimate");
        assert_eq!(estimate.seconds_per_frame, 40.0);
        assert_eq!(estimate.total_seconds, 10_000.0);
        assert!((estimate.total_hours - 10_000.0 / 3600.0).abs() < 1e-9);
    }

    #[test]
    fn single_frame_at_same_samples_is_identity() {
        let estimate = extrapolate(Duration::from_millis(1500), 64, 64, 1).expect("estimate");
        assert_eq!(estimate.total_seconds, 1.5);
    }

    #[test]
    fn zero_reduced_samples_is_rejected() {
        assert!(extrapolate(Duration::from_secs(1), 0, 128, 10).is_err());
    }

    #[test]
    fn reduced_samples_are_capped_and_floored() {
        assert_eq!(reduced_sample_count(128, 32), 32);
        assert_eq!(reduced_sample_count(16, 32), 16);
        assert_eq!(reduced_sample_count(0, 32), 1);
    }
}
