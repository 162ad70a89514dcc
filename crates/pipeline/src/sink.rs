//! Observer interface for live stage progress.

use lumen_core::stage::{StageName, StageResult};

/// Receives progress and diagnostic lines while a stage runs.
///
/// Callbacks are invoked from the executor task, in line order, and must
/// not block.
pub trait ProgressSink: Send + Sync {
    /// Percentage (0-100) plus a human-readable message.
    fn on_progress(&self, stage: StageName, percent: f64, message: &str);

    /// An error or warning line emitted by the tool.
    fn on_log(&self, stage: StageName, line: &str);

    /// The stage result changed (status, counts, logs).
    fn on_stage_update(&self, _result: &StageResult) {}
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn on_progress(&self, _stage: StageName, _percent: f64, _message: &str) {}

    fn on_log(&self, _stage: StageName, _line: &str) {}
}

/// Forwards progress to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn on_progress(&self, stage: StageName, percent: f64, message: &str) {
        tracing::info!(stage = %stage, percent = format!("{percent:.1}"), "{message}");
    }

    fn on_log(&self, stage: StageName, line: &str) {
        tracing::warn!(stage = %stage, "{line}");
    }
}
