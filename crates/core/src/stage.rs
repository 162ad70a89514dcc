//! Per-stage data model.
//!
//! A [`StageResult`] is created when its stage starts, mutated only by the
//! stage executor, and frozen once it reaches a terminal status. Mutating
//! calls on a terminal result are ignored.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::progress::tracker::ProgressUpdate;
use crate::types::Timestamp;

/// The five pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    Render,
    Denoise,
    Upscale,
    Interpolate,
    Encode,
}

impl StageName {
    pub const ALL: [StageName; 5] = [
        Self::Render,
        Self::Denoise,
        Self::Upscale,
        Self::Interpolate,
        Self::Encode,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Render => "render",
            Self::Denoise => "denoise",
            Self::Upscale => "upscale",
            Self::Interpolate => "interpolate",
            Self::Encode => "encode",
        }
    }

    /// Name of the stage's dedicated output directory below the run root.
    pub fn output_dir_name(self) -> &'static str {
        match self {
            Self::Render => "render",
            Self::Denoise => "denoised",
            Self::Upscale => "upscaled",
            Self::Interpolate => "interpolated",
            Self::Encode => "encoded",
        }
    }

    /// Whether the stage produces one output per input frame, so that the
    /// processed count must match the expected total on success.
    pub fn tracks_frames(self) -> bool {
        matches!(self, Self::Render | Self::Denoise | Self::Upscale)
    }
}

impl std::fmt::Display for StageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl StageStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

/// Category of a stage failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The tool is missing or could not be started.
    Launch,
    /// A filesystem operation failed.
    Io,
    /// The tool exceeded its wall-clock budget.
    Timeout,
    /// Non-zero exit, or a zero exit with a frame-count mismatch.
    Process,
}

/// Serializable failure reason attached to a failed stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl StageFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for StageFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Captured error and warning lines kept per stage. Later lines are
/// dropped; the failure reason is always recorded.
pub const MAX_LOG_LINES: usize = 1000;

/// Outcome and live progress of one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: StageName,
    pub status: StageStatus,
    pub frames_processed: u32,
    pub frames_total: u32,
    pub percent: f64,
    pub eta_secs: Option<f64>,
    pub message: Option<String>,
    pub started_at: Option<Timestamp>,
    pub ended_at: Option<Timestamp>,
    pub error_log: Vec<String>,
    pub warning_log: Vec<String>,
    /// Directory or file produced by this stage; the next stage's input.
    pub output_location: Option<PathBuf>,
    pub failure: Option<StageFailure>,
}

impl StageResult {
    pub fn new(stage: StageName, frames_total: u32) -> Self {
        Self {
            stage,
            status: StageStatus::Pending,
            frames_processed: 0,
            frames_total,
            percent: 0.0,
            eta_secs: None,
            message: None,
            started_at: None,
            ended_at: None,
            error_log: Vec::new(),
            warning_log: Vec::new(),
            output_location: None,
            failure: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn mark_running(&mut self, now: Timestamp, output_location: PathBuf) {
        if self.status != StageStatus::Pending {
            return;
        }
        self.status = StageStatus::Running;
        self.started_at = Some(now);
        self.output_location = Some(output_location);
    }

    pub fn apply_progress(&mut self, update: &ProgressUpdate) {
        if self.is_terminal() {
            return;
        }
        self.frames_processed = self.frames_processed.max(update.frames_processed);
        self.percent = update.percent;
        self.eta_secs = update.eta.map(|d| d.as_secs_f64());
        self.message = Some(update.message());
    }

    pub fn set_message(&mut self, message: impl Into<String>) {
        if !self.is_terminal() {
            self.message = Some(message.into());
        }
    }

    pub fn push_error(&mut self, line: impl Into<String>) {
        if !self.is_terminal() && self.error_log.len() < MAX_LOG_LINES {
            self.error_log.push(line.into());
        }
    }

    pub fn push_warning(&mut self, line: impl Into<String>) {
        if !self.is_terminal() && self.warning_log.len() < MAX_LOG_LINES {
            self.warning_log.push(line.into());
        }
    }

    pub fn succeed(&mut self, now: Timestamp) {
        if self.is_terminal() {
            return;
        }
        self.status = StageStatus::Succeeded;
        self.percent = 100.0;
        self.eta_secs = None;
        self.message = Some(format!("{} complete", self.stage));
        self.close(now);
    }

    /// Terminate as failed. The failure message is also appended to the
    /// error log so it travels with the captured tool lines.
    pub fn fail(&mut self, now: Timestamp, failure: StageFailure) {
        if self.is_terminal() {
            return;
        }
        self.status = StageStatus::Failed;
        self.error_log.push(failure.message.clone());
        self.message = Some(failure.message.clone());
        self.failure = Some(failure);
        self.eta_secs = None;
        self.close(now);
    }

    pub fn cancel(&mut self, now: Timestamp) {
        if self.is_terminal() {
            return;
        }
        self.status = StageStatus::Cancelled;
        self.eta_secs = None;
        self.message = Some(format!("{} cancelled", self.stage));
        self.close(now);
    }

    fn close(&mut self, now: Timestamp) {
        let started = *self.started_at.get_or_insert(now);
        self.ended_at = Some(now.max(started));
    }

    /// Wall-clock duration, once the stage has ended.
    pub fn duration(&self) -> Option<Duration> {
        let (start, end) = (self.started_at?, self.ended_at?);
        end.signed_duration_since(start).to_std().ok()
    }

    /// Processed frames as a percentage of the total (0 when untracked).
    pub fn completion_rate(&self) -> f64 {
        if self.frames_total == 0 {
            return 0.0;
        }
        f64::from(self.frames_processed) / f64::from(self.frames_total) * 100.0
    }

    pub fn seconds_per_frame(&self) -> Option<f64> {
        if self.frames_processed == 0 {
            return None;
        }
        Some(self.duration()?.as_secs_f64() / f64::from(self.frames_processed))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
