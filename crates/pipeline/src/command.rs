//! The seam between the orchestrator and the concrete tools.
//!
//! A [`CommandBuilder`] turns a run configuration plus the paths of one stage
//! into a [`StagePlan`]: the external invocations to run and how their
//! progress is observed. The executor only ever sees the plan.

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use lumen_core::config::RunConfiguration;
use lumen_core::stage::StageName;
use lumen_core::types::{DeviceId, FrameNumber};

use crate::error::StageError;

/// One external process invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct StageCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    /// Working directory; the stage output directory when unset.
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl StageCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Program name for log lines and error messages.
    pub fn program_name(&self) -> String {
        self.program.display().to_string()
    }
}

impl fmt::Display for StageCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// How the executor observes a stage's progress.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressSource {
    /// Parse frame numbers out of the tool's output lines.
    Stream,
    /// Count files with `extension` appearing in `dir`, polled on the
    /// configured cadence.
    OutputFiles { dir: PathBuf, extension: String },
    /// Each completed invocation is one processed frame.
    Invocations,
    /// No frame-level progress; the stage jumps to 100% on success.
    Untracked,
}

impl ProgressSource {
    /// Whether the success criterion compares processed and expected frames.
    pub fn counts_frames(&self) -> bool {
        !matches!(self, Self::Untracked)
    }
}

/// Everything the executor needs to run one stage.
#[derive(Debug, Clone, PartialEq)]
pub struct StagePlan {
    pub invocations: Vec<StageCommand>,
    pub progress: ProgressSource,
    /// Frame number the first reported frame corresponds to.
    pub frame_start: FrameNumber,
    /// Expected number of frames; 0 when untracked.
    pub frames_total: u32,
    /// What the stage produces: a frame directory or a single file.
    pub output_location: PathBuf,
}

impl StagePlan {
    pub fn single(command: StageCommand, progress: ProgressSource, output: PathBuf) -> Self {
        Self {
            invocations: vec![command],
            progress,
            frame_start: 1,
            frames_total: 0,
            output_location: output,
        }
    }

    pub fn with_frames(mut self, frame_start: FrameNumber, frames_total: u32) -> Self {
        self.frame_start = frame_start;
        self.frames_total = frames_total;
        self
    }
}

/// Paths and device assigned to one stage.
#[derive(Debug, Clone, PartialEq)]
pub struct StageContext {
    pub stage: StageName,
    /// Output of the previous stage; `None` for the first stage.
    pub input: Option<PathBuf>,
    /// The stage that produced `input`.
    pub previous: Option<StageName>,
    pub output_dir: PathBuf,
    /// Scratch directory removed when the stage ends.
    pub temp_dir: PathBuf,
    /// `None` means CPU.
    pub device: Option<DeviceId>,
}

impl StageContext {
    /// The input directory, or an error naming the stage that needs one.
    pub fn require_input(&self) -> Result<&Path, StageError> {
        self.input.as_deref().ok_or_else(|| {
            StageError::MissingInput(format!("<no input for {} stage>", self.stage))
        })
    }
}

/// Builds stage plans for concrete tools.
pub trait CommandBuilder: Send + Sync {
    fn build(&self, config: &RunConfiguration, ctx: &StageContext) -> Result<StagePlan, StageError>;

    /// Per-invocation time budget override; `None` uses the configured
    /// stage timeout.
    fn timeout(&self, _stage: StageName) -> Option<Duration> {
        None
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_collects_arguments() {
        let cmd = StageCommand::new("ffmpeg")
            .arg("-y")
            .args(["-framerate", "30"])
            .env("CUDA_VISIBLE_DEVICES", "1")
            .current_dir("/tmp");
        assert_eq!(cmd.args.len(), 3);
        assert_eq!(cmd.env, vec![("CUDA_VISIBLE_DEVICES".to_string(), "1".to_string())]);
        assert_eq!(cmd.working_dir.as_deref(), Some(Path::new("/tmp")));
        assert_eq!(cmd.to_string(), "ffmpeg -y -framerate 30");
    }

    #[test]
    fn untracked_does_not_count_frames() {
        assert!(!ProgressSource::Untracked.counts_frames());
        assert!(ProgressSource::Stream.counts_frames());
        assert!(ProgressSource::Invocations.counts_frames());
    }

    #[test]
    fn missing_input_is_reported() {
        let ctx = StageContext {
            stage: StageName::Encode,
            input: None,
            previous: None,
            output_dir: PathBuf::from("/out/encoded"),
            temp_dir: PathBuf::from("/out/.tmp"),
            device: None,
        };
        assert!(ctx.require_input().is_err());
    }
}
