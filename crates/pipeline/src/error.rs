//! Error types for stage execution and the orchestrator API.

use lumen_core::error::CoreError;
use lumen_core::stage::{FailureKind, StageFailure};

/// Errors raised while running one stage.
///
/// These never escape the executor: they are folded into the stage's
/// terminal [`StageResult`](lumen_core::stage::StageResult).
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("no input frames found in {0}")]
    MissingInput(String),

    #[error("timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("process exited with code {}", exit_code.map_or_else(|| "none (killed by signal)".to_string(), |c| c.to_string()))]
    Process { exit_code: Option<i32> },

    #[error("frame count mismatch: processed {processed} of {total} frames")]
    FrameCountMismatch { processed: u32, total: u32 },

    #[error("cancelled")]
    Cancelled,
}

impl StageError {
    /// Failure category, or `None` for a user-requested cancellation.
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            Self::Launch { .. } | Self::ToolNotFound(_) => Some(FailureKind::Launch),
            Self::Io(_) | Self::MissingInput(_) => Some(FailureKind::Io),
            Self::Timeout { .. } => Some(FailureKind::Timeout),
            Self::Process { .. } | Self::FrameCountMismatch { .. } => Some(FailureKind::Process),
            Self::Cancelled => None,
        }
    }

    pub fn to_failure(&self) -> Option<StageFailure> {
        self.kind().map(|kind| StageFailure::new(kind, self.to_string()))
    }
}

impl From<std::io::Error> for StageError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Errors returned synchronously by the orchestrator API.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Estimate failed: {0}")]
    Estimate(String),

    #[error("Estimate cancelled")]
    EstimateCancelled,

    #[error("Run task failed: {0}")]
    Join(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_process_exit_code() {
        let err = StageError::Process { exit_code: Some(1) };
        assert_eq!(err.to_string(), "process exited with code 1");
        let killed = StageError::Process { exit_code: None };
        assert!(killed.to_string().contains("killed by signal"));
    }

    #[test]
    fn display_frame_count_mismatch() {
        let err = StageError::FrameCountMismatch {
            processed: 2,
            total: 3,
        };
        assert_eq!(
            err.to_string(),
            "frame count mismatch: processed 2 of 3 frames"
        );
    }

    #[test]
    fn kinds_follow_taxonomy() {
        let launch = StageError::Launch {
            program: "blender".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        };
        assert_eq!(launch.kind(), Some(FailureKind::Launch));
        assert_eq!(
            StageError::Timeout { elapsed_ms: 10 }.kind(),
            Some(FailureKind::Timeout)
        );
        assert_eq!(
            StageError::FrameCountMismatch {
                processed: 1,
                total: 2
            }
            .kind(),
            Some(FailureKind::Process)
        );
        assert_eq!(StageError::MissingInput("/x".into()).kind(), Some(FailureKind::Io));
        assert_eq!(StageError::Cancelled.kind(), None);
        assert!(StageError::Cancelled.to_failure().is_none());
    }

    #[test]
    fn launch_error_has_source() {
        let err = StageError::Launch {
            program: "ffmpeg".to_string(),
            source: std::io::Error::other("boom"),
        };
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn pipeline_error_wraps_core() {
        let err: PipelineError = CoreError::AlreadyRunning.into();
        assert_eq!(err.to_string(), "Pipeline is already running");
    }
}
