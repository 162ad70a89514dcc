//! Sequences the planned stages of one run and owns the observable state.
//!
//! At most one run (or estimate) is in flight per [`Orchestrator`]. Stages
//! run strictly in order, each consuming the previous stage's output, and
//! the first failed or cancelled stage ends the run. The latest
//! [`PipelineRun`] snapshot is published through a `watch` channel.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Utc;
use lumen_core::config::RunConfiguration;
use lumen_core::device::{resolve_device, DeviceSelector};
use lumen_core::error::CoreError;
use lumen_core::estimation::{extrapolate, reduced_sample_count, RenderEstimate};
use lumen_core::run::{plan_stages, PipelineRun};
use lumen_core::stage::{FailureKind, StageFailure, StageName, StageResult, StageStatus};
use lumen_core::types::DeviceId;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::command::{CommandBuilder, StageContext};
use crate::error::{PipelineError, StageError};
use crate::executor::{StageExecutor, StageRequest};
use crate::probe::DeviceProbe;
use crate::settings::PipelineSettings;
use crate::sink::ProgressSink;
use crate::workspace::StageWorkspace;

/// Immutable per-run inputs, fixed before the first stage launches.
#[derive(Debug, Clone)]
struct RunContext {
    run_id: Uuid,
    config: RunConfiguration,
    planned: Vec<StageName>,
    device: Option<DeviceId>,
}

struct Inner {
    builder: Arc<dyn CommandBuilder>,
    probe: Arc<dyn DeviceProbe>,
    sink: Arc<dyn ProgressSink>,
    settings: PipelineSettings,
    snapshot: watch::Sender<PipelineRun>,
    active: Mutex<Option<CancellationToken>>,
}

/// Entry point for starting, observing and cancelling pipeline runs.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

/// A started run.
#[derive(Debug)]
pub struct RunHandle {
    run_id: Uuid,
    task: JoinHandle<PipelineRun>,
}

impl RunHandle {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Wait for the run to reach a terminal state.
    pub async fn wait(self) -> Result<PipelineRun, PipelineError> {
        self.task
            .await
            .map_err(|e| PipelineError::Join(e.to_string()))
    }
}

/// Holds the single-run slot; released on drop.
struct ActiveRun {
    inner: Arc<Inner>,
    token: CancellationToken,
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        let mut active = self
            .inner
            .active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *active = None;
    }
}

impl Orchestrator {
    pub fn new(
        builder: Arc<dyn CommandBuilder>,
        probe: Arc<dyn DeviceProbe>,
        sink: Arc<dyn ProgressSink>,
        settings: PipelineSettings,
    ) -> Self {
        let (snapshot, _) = watch::channel(PipelineRun::idle());
        Self {
            inner: Arc::new(Inner {
                builder,
                probe,
                sink,
                settings,
                snapshot,
                active: Mutex::new(None),
            }),
        }
    }

    /// Validate `config`, pick the device and launch the run in the
    /// background.
    ///
    /// Fails synchronously, before anything is launched, on an invalid
    /// configuration or while another run is in flight. Must be called from
    /// within a Tokio runtime.
    pub fn start(&self, config: RunConfiguration) -> Result<RunHandle, PipelineError> {
        config.validate()?;
        let guard = self.claim()?;
        let device = self.inner.resolve(&config)?;

        let ctx = RunContext {
            run_id: Uuid::now_v7(),
            planned: plan_stages(&config),
            config,
            device,
        };
        let run_id = ctx.run_id;

        tracing::info!(
            run_id = %run_id,
            stages = ?ctx.planned,
            device = ?device,
            frames = ctx.config.frame_count(),
            "Pipeline run starting"
        );
        self.inner.snapshot.send_replace(PipelineRun::new(
            run_id,
            ctx.planned.clone(),
            device,
            Utc::now(),
        ));

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let run = inner.drive(&ctx, &guard.token).await;
            drop(guard);
            run
        });

        Ok(RunHandle { run_id, task })
    }

    /// [`start`](Self::start) and wait for the terminal snapshot.
    pub async fn run(&self, config: RunConfiguration) -> Result<PipelineRun, PipelineError> {
        self.start(config)?.wait().await
    }

    /// Request cancellation of the in-flight run or estimate. Returns
    /// `false` when nothing is running.
    pub fn cancel(&self) -> bool {
        let active = self
            .inner
            .active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match active.as_ref() {
            Some(token) => {
                tracing::info!("Pipeline cancellation requested");
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .active
            .lock()
            .map(|active| active.is_some())
            .unwrap_or(false)
    }

    /// Latest snapshot of the current (or last) run.
    pub fn status(&self) -> PipelineRun {
        self.inner.snapshot.borrow().clone()
    }

    /// Receiver notified on every snapshot change.
    pub fn subscribe(&self) -> watch::Receiver<PipelineRun> {
        self.inner.snapshot.subscribe()
    }

    /// Estimate total render time from one reduced-sample test frame.
    ///
    /// Renders only the first frame, at no more than the configured
    /// estimate sample count, into a scratch directory that is removed
    /// afterwards. Holds the single-run slot while it runs, so
    /// [`cancel`](Self::cancel) applies.
    pub async fn estimate(&self, config: &RunConfiguration) -> Result<RenderEstimate, PipelineError> {
        config.validate()?;
        let guard = self.claim()?;

        let scratch = tempfile::Builder::new()
            .prefix("lumen-estimate-")
            .tempdir()?;
        let reduced = reduced_sample_count(config.sample_count, self.inner.settings.estimate_samples);
        let probe = config.single_frame_probe(reduced, scratch.path().to_path_buf());
        let device = self.inner.resolve(&probe)?;
        let ctx = RunContext {
            run_id: Uuid::now_v7(),
            planned: vec![StageName::Render],
            config: probe,
            device,
        };

        tracing::info!(
            reduced_samples = reduced,
            requested_samples = config.sample_count,
            frames = config.frame_count(),
            "Estimating render time"
        );

        let executor = StageExecutor::from_settings(&self.inner.settings);
        let started = Instant::now();
        let result = self
            .inner
            .run_stage(
                &executor,
                &ctx,
                StageName::Render,
                None,
                None,
                self.inner.sink.as_ref(),
                &guard.token,
            )
            .await;
        let measured = started.elapsed();

        match result.status {
            StageStatus::Succeeded => {
                let estimate = extrapolate(measured, reduced, config.sample_count, config.frame_count())?;
                tracing::info!(
                    test_seconds = estimate.test_seconds,
                    total_seconds = estimate.total_seconds,
                    "Estimate complete"
                );
                Ok(estimate)
            }
            StageStatus::Cancelled => Err(PipelineError::EstimateCancelled),
            _ => Err(PipelineError::Estimate(
                result
                    .failure
                    .map(|f| f.message)
                    .unwrap_or_else(|| "test render did not finish".to_string()),
            )),
        }
    }

    fn claim(&self) -> Result<ActiveRun, CoreError> {
        let mut active = self
            .inner
            .active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if active.is_some() {
            return Err(CoreError::AlreadyRunning);
        }
        let token = CancellationToken::new();
        *active = Some(token.clone());
        Ok(ActiveRun {
            inner: Arc::clone(&self.inner),
            token,
        })
    }
}

impl Inner {
    fn resolve(&self, config: &RunConfiguration) -> Result<Option<DeviceId>, CoreError> {
        let selector = DeviceSelector::new(self.settings.memory_threshold)?;
        let devices = self.probe.devices();
        let device = resolve_device(config.device, &devices, &selector)?;
        match device.and_then(|id| devices.iter().find(|d| d.id == id)) {
            Some(d) => tracing::info!(device = d.id, name = %d.name, "Selected device"),
            None => tracing::info!(available = devices.len(), "Running on CPU"),
        }
        Ok(device)
    }

    /// Run every planned stage in order and return the terminal snapshot.
    async fn drive(&self, ctx: &RunContext, token: &CancellationToken) -> PipelineRun {
        let executor = StageExecutor::from_settings(&self.settings);
        let observer = SnapshotSink {
            snapshot: &self.snapshot,
            inner: self.sink.as_ref(),
        };
        let mut input: Option<PathBuf> = None;
        let mut previous: Option<StageName> = None;

        for &stage in &ctx.planned {
            if token.is_cancelled() {
                self.update(|run| run.cancel(Utc::now()));
                tracing::info!(run_id = %ctx.run_id, "Pipeline run cancelled");
                return self.snapshot.borrow().clone();
            }

            let result = self
                .run_stage(&executor, ctx, stage, input.take(), previous, &observer, token)
                .await;

            match result.status {
                StageStatus::Succeeded => {
                    input = result.output_location.clone();
                    previous = Some(stage);
                }
                StageStatus::Cancelled => {
                    self.update(|run| run.cancel(Utc::now()));
                    tracing::info!(run_id = %ctx.run_id, stage = %stage, "Pipeline run cancelled");
                    return self.snapshot.borrow().clone();
                }
                StageStatus::Failed | StageStatus::Pending | StageStatus::Running => {
                    let failure = result.failure.clone().unwrap_or_else(|| {
                        StageFailure::new(FailureKind::Process, format!("{stage} did not finish"))
                    });
                    tracing::error!(
                        run_id = %ctx.run_id,
                        stage = %stage,
                        error = %failure.message,
                        "Pipeline run failed"
                    );
                    self.update(|run| run.fail(Utc::now(), failure));
                    return self.snapshot.borrow().clone();
                }
            }
        }

        self.update(|run| run.complete(Utc::now(), input.clone()));
        tracing::info!(
            run_id = %ctx.run_id,
            output = ?input,
            "Pipeline run complete"
        );
        self.snapshot.borrow().clone()
    }

    /// Prepare directories and the plan for `stage`, then execute it. The
    /// stage's scratch directory is gone by the time this returns.
    #[allow(clippy::too_many_arguments)]
    async fn run_stage(
        &self,
        executor: &StageExecutor,
        ctx: &RunContext,
        stage: StageName,
        input: Option<PathBuf>,
        previous: Option<StageName>,
        observer: &dyn ProgressSink,
        token: &CancellationToken,
    ) -> StageResult {
        let workspace = match StageWorkspace::create(&ctx.config.output_root, stage) {
            Ok(workspace) => workspace,
            Err(e) => {
                let location = ctx.config.output_root.join(stage.output_dir_name());
                return fail_before_launch(stage, location, &StageError::from(e), observer);
            }
        };

        let stage_ctx = StageContext {
            stage,
            input,
            previous,
            output_dir: workspace.output_dir().to_path_buf(),
            temp_dir: workspace.temp_dir().to_path_buf(),
            device: ctx.device,
        };

        let plan = match self.builder.build(&ctx.config, &stage_ctx) {
            Ok(plan) => plan,
            Err(e) => return fail_before_launch(stage, stage_ctx.output_dir, &e, observer),
        };

        let timeout = self
            .builder
            .timeout(stage)
            .unwrap_or_else(|| self.settings.timeouts.for_stage(stage));
        let request = StageRequest {
            stage,
            plan,
            working_dir: stage_ctx.output_dir.clone(),
            timeout,
        };

        let result = executor.run_stage(request, observer, token).await;
        drop(workspace);
        result
    }

    fn update(&self, change: impl FnOnce(&mut PipelineRun) -> Result<(), CoreError>) {
        self.snapshot.send_modify(|run| {
            if let Err(e) = change(run) {
                tracing::error!(error = %e, "Rejected pipeline state change");
            }
        });
    }
}

/// A stage that failed before its tool could be launched.
fn fail_before_launch(
    stage: StageName,
    location: PathBuf,
    error: &StageError,
    observer: &dyn ProgressSink,
) -> StageResult {
    tracing::error!(stage = %stage, error = %error, "Stage could not be prepared");
    let now = Utc::now();
    let mut result = StageResult::new(stage, 0);
    result.mark_running(now, location);
    let failure = error
        .to_failure()
        .unwrap_or_else(|| StageFailure::new(FailureKind::Launch, error.to_string()));
    result.fail(now, failure);
    observer.on_stage_update(&result);
    observer.on_progress(stage, result.percent, &error.to_string());
    result
}

/// Mirrors stage updates into the run snapshot and forwards everything to
/// the caller's sink.
struct SnapshotSink<'a> {
    snapshot: &'a watch::Sender<PipelineRun>,
    inner: &'a dyn ProgressSink,
}

impl ProgressSink for SnapshotSink<'_> {
    fn on_progress(&self, stage: StageName, percent: f64, message: &str) {
        self.inner.on_progress(stage, percent, message);
    }

    fn on_log(&self, stage: StageName, line: &str) {
        self.inner.on_log(stage, line);
    }

    fn on_stage_update(&self, result: &StageResult) {
        self.snapshot.send_modify(|run| {
            if run.stages.last().is_some_and(|s| s.stage == result.stage) {
                run.update_stage(result);
            } else if let Err(e) = run.begin_stage(result.clone()) {
                tracing::error!(stage = %result.stage, error = %e, "Rejected stage start");
            }
        });
        self.inner.on_stage_update(result);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
