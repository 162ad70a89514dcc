//! Frame accounting, percentage and ETA for one stage.

use std::time::{Duration, Instant};

use serde::Serialize;

use crate::types::FrameNumber;

/// Highest percentage reported before the tool has exited successfully.
pub const MAX_RUNNING_PERCENT: f64 = 99.0;

/// Minimum completed frames before an ETA is reported.
const MIN_FRAMES_FOR_ETA: u32 = 2;

/// Snapshot returned after each recorded advance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProgressUpdate {
    pub frames_processed: u32,
    pub frames_total: u32,
    pub percent: f64,
    pub eta: Option<Duration>,
}

impl ProgressUpdate {
    /// Human-readable progress line, e.g. `frame 3/10 (30.0%) - ETA 1m 12s`.
    pub fn message(&self) -> String {
        let base = format!(
            "frame {}/{} ({:.1}%)",
            self.frames_processed, self.frames_total, self.percent
        );
        match self.eta {
            Some(eta) => format!("{base} - ETA {}", format_duration(eta)),
            None => base,
        }
    }
}

/// Monotonic frame counter for one stage.
///
/// `frames_processed` never decreases: duplicate and late events are
/// absorbed by taking the maximum.
#[derive(Debug, Clone)]
pub struct FrameProgress {
    frame_start: FrameNumber,
    frames_total: u32,
    frames_processed: u32,
    /// When the first advance was observed, and the count at that moment.
    first_advance: Option<(Instant, u32)>,
}

impl FrameProgress {
    pub fn new(frame_start: FrameNumber, frames_total: u32) -> Self {
        Self {
            frame_start,
            frames_total,
            frames_processed: 0,
            first_advance: None,
        }
    }

    pub fn frames_processed(&self) -> u32 {
        self.frames_processed
    }

    pub fn frames_total(&self) -> u32 {
        self.frames_total
    }

    /// Record that the tool reported absolute frame `frame` as done.
    pub fn record_frame(&mut self, frame: FrameNumber, now: Instant) -> ProgressUpdate {
        let offset = if frame >= self.frame_start {
            frame - self.frame_start + 1
        } else {
            0
        };
        self.record_processed(offset, now)
    }

    /// Record an absolute processed count (file-count polling, completed
    /// invocations).
    pub fn record_processed(&mut self, processed: u32, now: Instant) -> ProgressUpdate {
        if processed > self.frames_processed {
            self.frames_processed = processed;
            if self.first_advance.is_none() {
                self.first_advance = Some((now, processed));
            }
        }
        self.update(now)
    }

    /// Current percentage, capped at [`MAX_RUNNING_PERCENT`].
    pub fn percent(&self) -> f64 {
        if self.frames_total == 0 {
            return 0.0;
        }
        let raw = f64::from(self.frames_processed) / f64::from(self.frames_total) * 100.0;
        raw.min(MAX_RUNNING_PERCENT)
    }

    /// Rolling ETA: average seconds per frame since the first observed
    /// advance, multiplied by the frames remaining.
    pub fn eta(&self, now: Instant) -> Option<Duration> {
        if self.frames_processed < MIN_FRAMES_FOR_ETA {
            return None;
        }
        let (first_at, first_count) = self.first_advance?;
        let since_first = self.frames_processed.checked_sub(first_count)?;
        if since_first == 0 {
            return None;
        }
        let elapsed = now.saturating_duration_since(first_at).as_secs_f64();
        let avg = elapsed / f64::from(since_first);
        let remaining = self.frames_total.saturating_sub(self.frames_processed);
        Some(Duration::from_secs_f64(avg * f64::from(remaining)))
    }

    fn update(&self, now: Instant) -> ProgressUpdate {
        ProgressUpdate {
            frames_processed: self.frames_processed,
            frames_total: self.frames_total,
            percent: self.percent(),
            eta: self.eta(now),
        }
    }
}

/// Format a duration as `1h 02m`, `4m 05s` or `12s`.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h {m:02}m")
    } else if m > 0 {
        format!("{m}m {s:02}s")
    } else {
        format!("{s}s")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_order_frames_never_regress() {
        let now = Instant::now();
        let mut progress = FrameProgress::new(1, 10);
        let observed: Vec<u32> = [5, 3, 6]
            .into_iter()
            .map(|f| progress.record_frame(f, now).frames_processed)
            .collect();
        assert_eq!(observed, vec![5, 5, 6]);
    }

    #[test]
    fn duplicate_frame_advances_once() {
        let now = Instant::now();
        let mut progress = FrameProgress::new(1, 10);
        progress.record_frame(4, now);
        let second = progress.record_frame(4, now);
        assert_eq!(second.frames_processed, 4);
    }

    #[test]
    fn frame_offset_respects_frame_start() {
        let now = Instant::now();
        let mut progress = FrameProgress::new(100, 10);
        assert_eq!(progress.record_frame(100, now).frames_processed, 1);
        assert_eq!(progress.record_frame(104, now).frames_processed, 5);
        // Frames before the range do not count.
        assert_eq!(progress.record_frame(50, now).frames_processed, 5);
    }

    #[test]
    fn percent_is_capped_below_completion() {
        let now = Instant::now();
        let mut progress = FrameProgress::new(1, 3);
        let update = progress.record_frame(3, now);
        assert_eq!(update.frames_processed, 3);
        assert_eq!(update.percent, MAX_RUNNING_PERCENT);
    }

    #[test]
    fn zero_total_reports_zero_percent() {
        let progress = FrameProgress::new(1, 0);
        assert_eq!(progress.percent(), 0.0);
    }

    #[test]
    fn eta_needs_two_frames() {
        let start = Instant::now();
        let mut progress = FrameProgress::new(1, 10);
        assert!(progress.record_frame(1, start).eta.is_none());

        let later = start + Duration::from_secs(10);
        let update = progress.record_frame(2, later);
        // One frame since the first advance took 10s, 8 frames remain.
        assert_eq!(update.eta, Some(Duration::from_secs(80)));
    }

    #[test]
    fn eta_uses_frames_since_first_advance() {
        let start = Instant::now();
        let mut progress = FrameProgress::new(1, 20);
        progress.record_frame(4, start);
        let update = progress.record_frame(8, start + Duration::from_secs(20));
        // 4 frames in 20s => 5s/frame, 12 remaining.
        assert_eq!(update.eta, Some(Duration::from_secs(60)));
    }

    #[test]
    fn message_includes_eta_when_known() {
        let update = ProgressUpdate {
            frames_processed: 3,
            frames_total: 10,
            percent: 30.0,
            eta: Some(Duration::from_secs(72)),
        };
        assert_eq!(update.message(), "frame 3/10 (30.0%) - ETA 1m 12s");
    }

    #[test]
    fn duration_formatting() {
        assert_eq!(format_duration(Duration::from_secs(12)), "12s");
        assert_eq!(format_duration(Duration::from_secs(245)), "4m 05s");
        assert_eq!(format_duration(Duration::from_secs(3720)), "1h 02m");
    }
}
