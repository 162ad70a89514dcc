//! Runs one stage's external invocations to a terminal [`StageResult`].
//!
//! The executor never returns an error: launch failures, I/O problems,
//! timeouts, non-zero exits and frame-count mismatches all become a
//! `Failed` result, and a cancelled token becomes `Cancelled`.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::Utc;
use lumen_core::progress::parser::{Diagnostic, ProgressEvent, StreamProgressParser};
use lumen_core::progress::tracker::{FrameProgress, ProgressUpdate};
use lumen_core::stage::{StageName, StageResult};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::command::{ProgressSource, StageCommand, StagePlan};
use crate::error::StageError;
use crate::settings::PipelineSettings;
use crate::sink::ProgressSink;
use crate::subprocess;

/// How long buffered output is still consumed after a tool has exited.
/// Bounded because a tool's own children may keep the pipes open.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// A stage ready to run.
#[derive(Debug, Clone)]
pub struct StageRequest {
    pub stage: StageName,
    pub plan: StagePlan,
    /// Default working directory for invocations.
    pub working_dir: PathBuf,
    /// Budget for each invocation.
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct StageExecutor {
    cancel_grace: Duration,
    poll_interval: Duration,
}

impl StageExecutor {
    pub fn new(cancel_grace: Duration, poll_interval: Duration) -> Self {
        Self {
            cancel_grace,
            poll_interval,
        }
    }

    pub fn from_settings(settings: &PipelineSettings) -> Self {
        Self::new(settings.cancel_grace, settings.poll_interval)
    }

    /// Run every invocation in `request.plan` in order, stopping at the
    /// first failure.
    pub async fn run_stage(
        &self,
        request: StageRequest,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> StageResult {
        let mut run = StageRun::new(&request.plan, request.stage, sink);
        run.result
            .mark_running(Utc::now(), request.plan.output_location.clone());
        sink.on_stage_update(&run.result);

        tracing::info!(
            stage = %request.stage,
            invocations = request.plan.invocations.len(),
            frames_total = request.plan.frames_total,
            "Stage started"
        );

        let outcome = self.execute(&request, &mut run, cancel).await;
        run.finish(outcome)
    }

    async fn execute(
        &self,
        request: &StageRequest,
        run: &mut StageRun<'_>,
        cancel: &CancellationToken,
    ) -> Result<(), StageError> {
        let count = request.plan.invocations.len();
        for (index, command) in request.plan.invocations.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(StageError::Cancelled);
            }
            tracing::debug!(
                stage = %request.stage,
                invocation = index + 1,
                of = count,
                command = %command,
                "Launching tool"
            );
            self.run_invocation(command, request, run, cancel).await?;

            if run.source == ProgressSource::Invocations {
                run.record_processed(u32::try_from(index + 1).unwrap_or(u32::MAX));
            }
        }

        if let ProgressSource::OutputFiles { dir, extension } = &request.plan.progress {
            run.poll_output(dir, extension).await;
        }
        Ok(())
    }

    async fn run_invocation(
        &self,
        command: &StageCommand,
        request: &StageRequest,
        run: &mut StageRun<'_>,
        cancel: &CancellationToken,
    ) -> Result<(), StageError> {
        let started = Instant::now();
        let mut tool = subprocess::spawn(command, &request.working_dir)?;

        let deadline = tokio::time::sleep(request.timeout);
        tokio::pin!(deadline);

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let polling = match &request.plan.progress {
            ProgressSource::OutputFiles { dir, extension } => Some((dir.as_path(), extension.as_str())),
            _ => None,
        };

        let mut lines_open = true;
        let status = loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    tracing::info!(stage = %request.stage, "Cancellation requested, stopping tool");
                    subprocess::terminate(&mut tool.child, self.cancel_grace).await;
                    drain(&mut tool.lines, run).await;
                    return Err(StageError::Cancelled);
                }
                _ = &mut deadline => {
                    let elapsed_ms = started.elapsed().as_millis() as u64;
                    tracing::warn!(stage = %request.stage, elapsed_ms, "Tool timed out, killing");
                    subprocess::terminate(&mut tool.child, Duration::ZERO).await;
                    drain(&mut tool.lines, run).await;
                    return Err(StageError::Timeout { elapsed_ms });
                }
                status = tool.child.wait() => break status?,
                line = tool.lines.recv(), if lines_open => match line {
                    Some(line) => run.handle_line(&line),
                    None => lines_open = false,
                },
                _ = ticker.tick(), if polling.is_some() => {
                    if let Some((dir, extension)) = polling {
                        run.poll_output(dir, extension).await;
                    }
                }
            }
        };

        drain(&mut tool.lines, run).await;

        tracing::debug!(
            stage = %request.stage,
            exit_code = ?status.code(),
            duration_ms = started.elapsed().as_millis() as u64,
            "Tool exited"
        );

        if status.success() {
            Ok(())
        } else {
            Err(StageError::Process {
                exit_code: status.code(),
            })
        }
    }
}

/// Consume whatever output is still buffered.
async fn drain(lines: &mut mpsc::Receiver<String>, run: &mut StageRun<'_>) {
    let consume = async {
        while let Some(line) = lines.recv().await {
            run.handle_line(&line);
        }
    };
    if tokio::time::timeout(DRAIN_TIMEOUT, consume).await.is_err() {
        tracing::debug!(stage = %run.stage, "Tool output still open after exit, ignoring the rest");
    }
}

/// Mutable state of one stage while it runs.
struct StageRun<'a> {
    stage: StageName,
    source: ProgressSource,
    result: StageResult,
    parser: StreamProgressParser,
    progress: FrameProgress,
    sink: &'a dyn ProgressSink,
}

impl<'a> StageRun<'a> {
    fn new(plan: &StagePlan, stage: StageName, sink: &'a dyn ProgressSink) -> Self {
        Self {
            stage,
            source: plan.progress.clone(),
            result: StageResult::new(stage, plan.frames_total),
            parser: StreamProgressParser::new(),
            progress: FrameProgress::new(plan.frame_start, plan.frames_total),
            sink,
        }
    }

    fn handle_line(&mut self, line: &str) {
        tracing::debug!(stage = %self.stage, "{line}");
        let events = self.parser.parse_line(line);
        if events.is_empty() {
            return;
        }

        if self.source == ProgressSource::Stream {
            match events.progress {
                Some(ProgressEvent::FrameCompleted { frame }) => {
                    tracing::debug!(
                        stage = %self.stage,
                        frame,
                        pattern = events.pattern.as_deref().unwrap_or_default(),
                        "Frame completed"
                    );
                    let update = self.progress.record_frame(frame, Instant::now());
                    self.publish(&update);
                }
                Some(ProgressEvent::TileProgress { done, total }) => {
                    let message = format!("{}: tile {done}/{total}", self.stage);
                    self.result.set_message(message.clone());
                    self.sink.on_progress(self.stage, self.result.percent, &message);
                }
                None => {}
            }
        }

        match events.diagnostic {
            Some(Diagnostic::Error(text)) => {
                tracing::warn!(stage = %self.stage, "{text}");
                self.result.push_error(text.clone());
                self.sink.on_log(self.stage, &text);
            }
            Some(Diagnostic::Warning(text)) => {
                tracing::warn!(stage = %self.stage, "{text}");
                self.result.push_warning(text.clone());
                self.sink.on_log(self.stage, &text);
            }
            None => {}
        }

        self.sink.on_stage_update(&self.result);
    }

    fn record_processed(&mut self, processed: u32) {
        if processed <= self.progress.frames_processed() {
            return;
        }
        let update = self.progress.record_processed(processed, Instant::now());
        self.publish(&update);
        self.sink.on_stage_update(&self.result);
    }

    async fn poll_output(&mut self, dir: &Path, extension: &str) {
        match subprocess::count_files(dir, extension).await {
            Ok(count) => self.record_processed(count),
            Err(e) => {
                tracing::warn!(stage = %self.stage, dir = %dir.display(), error = %e, "Failed to count output files");
            }
        }
    }

    fn publish(&mut self, update: &ProgressUpdate) {
        self.result.apply_progress(update);
        let message = format!("{}: {}", self.stage, update.message());
        self.sink.on_progress(self.stage, update.percent, &message);
    }

    /// Apply the exit policy and close the result.
    fn finish(mut self, outcome: Result<(), StageError>) -> StageResult {
        let outcome = outcome.and_then(|()| {
            let processed = self.result.frames_processed;
            let total = self.result.frames_total;
            if self.source.counts_frames() && processed != total {
                Err(StageError::FrameCountMismatch { processed, total })
            } else {
                Ok(())
            }
        });

        let now = Utc::now();
        match outcome {
            Ok(()) => {
                self.result.succeed(now);
                tracing::info!(
                    stage = %self.stage,
                    frames_processed = self.result.frames_processed,
                    duration_secs = self.result.duration().map(|d| d.as_secs_f64()),
                    "Stage succeeded"
                );
            }
            Err(StageError::Cancelled) => {
                self.result.cancel(now);
                tracing::info!(
                    stage = %self.stage,
                    frames_processed = self.result.frames_processed,
                    "Stage cancelled"
                );
            }
            Err(e) => {
                tracing::error!(stage = %self.stage, error = %e, "Stage failed");
                if let Some(failure) = e.to_failure() {
                    self.result.fail(now, failure);
                }
            }
        }

        let message = self.result.message.clone().unwrap_or_default();
        self.sink.on_progress(self.stage, self.result.percent, &message);
        self.sink.on_stage_update(&self.result);
        self.result
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use assert_matches::assert_matches;
    use lumen_core::stage::{FailureKind, StageStatus};

    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        progress: Mutex<Vec<f64>>,
        logs: Mutex<Vec<String>>,
    }

    impl ProgressSink for RecordingSink {
        fn on_progress(&self, _stage: StageName, percent: f64, _message: &str) {
            self.progress.lock().unwrap().push(percent);
        }

        fn on_log(&self, _stage: StageName, line: &str) {
            self.logs.lock().unwrap().push(line.to_string());
        }
    }

    fn sh(script: &str) -> StageCommand {
        StageCommand::new("sh").arg("-c").arg(script)
    }

    fn executor() -> StageExecutor {
        StageExecutor::new(Duration::from_secs(1), Duration::from_millis(20))
    }

    fn request(dir: &Path, plan: StagePlan) -> StageRequest {
        StageRequest {
            stage: StageName::Render,
            plan,
            working_dir: dir.to_path_buf(),
            timeout: Duration::from_secs(10),
        }
    }

    fn stream_plan(script: &str, dir: &Path, frames: u32) -> StagePlan {
        StagePlan::single(sh(script), ProgressSource::Stream, dir.to_path_buf()).with_frames(1, frames)
    }

    #[tokio::test]
    async fn stream_progress_success() {
        let dir = tempfile::tempdir().unwrap();
        let sink = RecordingSink::default();
        let plan = stream_plan("echo Fra:1; echo Fra:2; echo Fra:3", dir.path(), 3);

        let result = executor()
            .run_stage(request(dir.path(), plan), &sink, &CancellationToken::new())
            .await;

        assert_eq!(result.status, StageStatus::Succeeded);
        assert_eq!(result.frames_processed, 3);
        assert_eq!(result.percent, 100.0);
        let progress = sink.progress.lock().unwrap();
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(progress.last(), Some(&100.0));
        assert!(progress.iter().rev().skip(1).all(|p| *p <= 99.0));
    }

    #[tokio::test]
    async fn out_of_order_frames_do_not_regress() {
        let dir = tempfile::tempdir().unwrap();
        let plan = stream_plan("echo Fra:2; echo Fra:1; echo Fra:3", dir.path(), 3);
        let result = executor()
            .run_stage(request(dir.path(), plan), &RecordingSink::default(), &CancellationToken::new())
            .await;
        assert_eq!(result.status, StageStatus::Succeeded);
        assert_eq!(result.frames_processed, 3);
    }

    #[tokio::test]
    async fn frame_count_mismatch_fails() {
        let dir = tempfile::tempdir().unwrap();
        let plan = stream_plan("echo Fra:1; echo Fra:2", dir.path(), 3);
        let result = executor()
            .run_stage(request(dir.path(), plan), &RecordingSink::default(), &CancellationToken::new())
            .await;
        assert_eq!(result.status, StageStatus::Failed);
        assert_eq!(result.frames_processed, 2);
        let failure = result.failure.unwrap();
        assert_eq!(failure.kind, FailureKind::Process);
        assert!(failure.message.contains("processed 2 of 3"));
    }

    #[tokio::test]
    async fn non_zero_exit_fails_and_keeps_logs() {
        let dir = tempfile::tempdir().unwrap();
        let sink = RecordingSink::default();
        let plan = stream_plan(
            "echo 'Warning: low memory'; echo 'Error: scene missing' 1>&2; exit 1",
            dir.path(),
            1,
        );
        let result = executor()
            .run_stage(request(dir.path(), plan), &sink, &CancellationToken::new())
            .await;
        assert_eq!(result.status, StageStatus::Failed);
        assert_matches!(result.failure.as_ref().map(|f| f.kind), Some(FailureKind::Process));
        assert!(result.error_log.iter().any(|l| l.contains("scene missing")));
        assert_eq!(result.warning_log, vec!["Warning: low memory".to_string()]);
        assert_eq!(sink.logs.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn launch_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let plan = StagePlan::single(
            StageCommand::new("/nonexistent/renderer"),
            ProgressSource::Stream,
            dir.path().to_path_buf(),
        )
        .with_frames(1, 1);
        let result = executor()
            .run_stage(request(dir.path(), plan), &RecordingSink::default(), &CancellationToken::new())
            .await;
        assert_eq!(result.status, StageStatus::Failed);
        assert_eq!(result.failure.unwrap().kind, FailureKind::Launch);
        assert!(result.ended_at >= result.started_at);
    }

    #[tokio::test]
    async fn timeout_kills_tool() {
        let dir = tempfile::tempdir().unwrap();
        let plan = stream_plan("echo Fra:1; exec sleep 30", dir.path(), 3);
        let mut req = request(dir.path(), plan);
        req.timeout = Duration::from_millis(300);

        let started = Instant::now();
        let result = executor()
            .run_stage(req, &RecordingSink::default(), &CancellationToken::new())
            .await;
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(result.status, StageStatus::Failed);
        assert_eq!(result.failure.unwrap().kind, FailureKind::Timeout);
        assert_eq!(result.frames_processed, 1);
    }

    #[tokio::test]
    async fn cancellation_stops_tool() {
        let dir = tempfile::tempdir().unwrap();
        let plan = stream_plan("echo Fra:1; exec sleep 30", dir.path(), 3);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });

        let result = executor()
            .run_stage(request(dir.path(), plan), &RecordingSink::default(), &cancel)
            .await;
        assert_eq!(result.status, StageStatus::Cancelled);
        assert_eq!(result.frames_processed, 1);
        assert!(result.failure.is_none());
    }

    #[tokio::test]
    async fn invocations_count_as_frames() {
        let dir = tempfile::tempdir().unwrap();
        let plan = StagePlan {
            invocations: vec![sh("true"), sh("true"), sh("true")],
            progress: ProgressSource::Invocations,
            frame_start: 1,
            frames_total: 3,
            output_location: dir.path().to_path_buf(),
        };
        let result = executor()
            .run_stage(request(dir.path(), plan), &RecordingSink::default(), &CancellationToken::new())
            .await;
        assert_eq!(result.status, StageStatus::Succeeded);
        assert_eq!(result.frames_processed, 3);
    }

    #[tokio::test]
    async fn failed_invocation_stops_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let plan = StagePlan {
            invocations: vec![sh("true"), sh("exit 2"), sh("touch never")],
            progress: ProgressSource::Invocations,
            frame_start: 1,
            frames_total: 3,
            output_location: dir.path().to_path_buf(),
        };
        let result = executor()
            .run_stage(request(dir.path(), plan), &RecordingSink::default(), &CancellationToken::new())
            .await;
        assert_eq!(result.status, StageStatus::Failed);
        assert_eq!(result.frames_processed, 1);
        assert!(!dir.path().join("never").exists());
    }

    #[tokio::test]
    async fn output_files_are_polled() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("upscaled");
        std::fs::create_dir(&out).unwrap();
        let script = "for i in 1 2 3; do touch upscaled/frame_$i.png; sleep 0.05; done";
        let plan = StagePlan::single(
            sh(script),
            ProgressSource::OutputFiles {
                dir: out.clone(),
                extension: "png".to_string(),
            },
            out,
        )
        .with_frames(1, 3);
        let result = executor()
            .run_stage(request(dir.path(), plan), &RecordingSink::default(), &CancellationToken::new())
            .await;
        assert_eq!(result.status, StageStatus::Succeeded);
        assert_eq!(result.frames_processed, 3);
    }

    #[tokio::test]
    async fn untracked_stage_succeeds_on_exit() {
        let dir = tempfile::tempdir().unwrap();
        let plan = StagePlan::single(sh("echo encoding"), ProgressSource::Untracked, dir.path().join("out.mov"));
        let mut req = request(dir.path(), plan);
        req.stage = StageName::Encode;
        let result = executor()
            .run_stage(req, &RecordingSink::default(), &CancellationToken::new())
            .await;
        assert_eq!(result.status, StageStatus::Succeeded);
        assert_eq!(result.percent, 100.0);
        assert_eq!(result.output_location, Some(dir.path().join("out.mov")));
    }

    #[tokio::test]
    async fn tile_progress_sets_message_without_counting() {
        let dir = tempfile::tempdir().unwrap();
        let plan = stream_plan("echo 'Rendered 4/16 Tiles'; echo Fra:1", dir.path(), 1);
        let result = executor()
            .run_stage(request(dir.path(), plan), &RecordingSink::default(), &CancellationToken::new())
            .await;
        assert_eq!(result.status, StageStatus::Succeeded);
        assert_eq!(result.frames_processed, 1);
    }
}
