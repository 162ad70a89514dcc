//! Pipeline run state machine and snapshot.
//!
//! ```text
//! Idle -> Rendering -> Denoising -> [Upscaling] -> [Interpolating] -> Encoding -> Complete
//!           \______________ any non-terminal state ______________/
//!                               |            |
//!                            Failed      Cancelled
//! ```
//!
//! `Complete`, `Failed` and `Cancelled` are terminal. A new run may start
//! from `Idle` or any terminal state.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{DenoiseMethod, RunConfiguration};
use crate::error::CoreError;
use crate::stage::{StageFailure, StageName, StageResult, StageStatus};
use crate::types::{DeviceId, Timestamp};

/// Orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    Rendering,
    Denoising,
    Upscaling,
    Interpolating,
    Encoding,
    Complete,
    Failed,
    Cancelled,
}

impl PipelineState {
    pub fn for_stage(stage: StageName) -> Self {
        match stage {
            StageName::Render => Self::Rendering,
            StageName::Denoise => Self::Denoising,
            StageName::Upscale => Self::Upscaling,
            StageName::Interpolate => Self::Interpolating,
            StageName::Encode => Self::Encoding,
        }
    }

    pub fn stage(self) -> Option<StageName> {
        match self {
            Self::Rendering => Some(StageName::Render),
            Self::Denoising => Some(StageName::Denoise),
            Self::Upscaling => Some(StageName::Upscale),
            Self::Interpolating => Some(StageName::Interpolate),
            Self::Encoding => Some(StageName::Encode),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Cancelled)
    }

    /// Whether `self -> to` is an edge of the state machine.
    ///
    /// Stage states only move forward; skipped optional stages are
    /// simply jumped over.
    pub fn can_transition_to(self, to: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self, to) {
            (_, Self::Failed) | (_, Self::Cancelled) => true,
            (Self::Idle, Self::Rendering) => true,
            (Self::Encoding, Self::Complete) => true,
            (from, to) => match (from.stage(), to.stage()) {
                (Some(a), Some(b)) => a < b,
                _ => false,
            },
        }
    }
}

/// Overall status derived from the stage results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Idle,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

/// Ordered list of stages enabled by `config`.
pub fn plan_stages(config: &RunConfiguration) -> Vec<StageName> {
    let mut stages = vec![StageName::Render];
    if config.denoise != DenoiseMethod::None {
        stages.push(StageName::Denoise);
    }
    if config.upscale {
        stages.push(StageName::Upscale);
    }
    if config.interpolate {
        stages.push(StageName::Interpolate);
    }
    stages.push(StageName::Encode);
    stages
}

/// Snapshot of one pipeline run. Owned by the orchestrator; observers
/// receive clones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub run_id: Option<Uuid>,
    pub state: PipelineState,
    /// Enabled stages in execution order.
    pub planned: Vec<StageName>,
    /// One result per stage that has started, in execution order.
    pub stages: Vec<StageResult>,
    pub device: Option<DeviceId>,
    pub started_at: Option<Timestamp>,
    pub ended_at: Option<Timestamp>,
    /// Final artifact (the encoded video) on success.
    pub output: Option<PathBuf>,
    /// First halting failure.
    pub failure: Option<StageFailure>,
}

impl Default for PipelineRun {
    fn default() -> Self {
        Self::idle()
    }
}

impl PipelineRun {
    /// The snapshot before any run has been started.
    pub fn idle() -> Self {
        Self {
            run_id: None,
            state: PipelineState::Idle,
            planned: Vec::new(),
            stages: Vec::new(),
            device: None,
            started_at: None,
            ended_at: None,
            output: None,
            failure: None,
        }
    }

    pub fn new(
        run_id: Uuid,
        planned: Vec<StageName>,
        device: Option<DeviceId>,
        now: Timestamp,
    ) -> Self {
        Self {
            run_id: Some(run_id),
            planned,
            device,
            started_at: Some(now),
            ..Self::idle()
        }
    }

    pub fn status(&self) -> RunStatus {
        if self.state == PipelineState::Idle && self.stages.is_empty() {
            return if self.run_id.is_some() {
                RunStatus::Running
            } else {
                RunStatus::Idle
            };
        }
        if self.stages.iter().any(|s| s.status == StageStatus::Failed)
            || self.state == PipelineState::Failed
        {
            return RunStatus::Failed;
        }
        if self.stages.iter().any(|s| s.status == StageStatus::Cancelled)
            || self.state == PipelineState::Cancelled
        {
            return RunStatus::Cancelled;
        }
        let all_done = self.stages.len() == self.planned.len()
            && self.stages.iter().all(|s| s.status == StageStatus::Succeeded);
        if self.state == PipelineState::Complete && all_done {
            RunStatus::Succeeded
        } else {
            RunStatus::Running
        }
    }

    pub fn stage(&self, name: StageName) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.stage == name)
    }

    pub fn current_stage(&self) -> Option<&StageResult> {
        self.stages.last().filter(|s| !s.is_terminal())
    }

    pub fn duration(&self) -> Option<Duration> {
        let (start, end) = (self.started_at?, self.ended_at?);
        end.signed_duration_since(start).to_std().ok()
    }

    /// Move the state machine; illegal edges are rejected.
    pub fn transition(&mut self, to: PipelineState) -> Result<(), CoreError> {
        if !self.state.can_transition_to(to) {
            return Err(CoreError::Internal(format!(
                "illegal pipeline transition {:?} -> {:?}",
                self.state, to
            )));
        }
        self.state = to;
        Ok(())
    }

    /// Enter the state for `result.stage` and record its result.
    pub fn begin_stage(&mut self, result: StageResult) -> Result<(), CoreError> {
        self.transition(PipelineState::for_stage(result.stage))?;
        self.stages.push(result);
        Ok(())
    }

    /// Replace the in-flight result for `result.stage`.
    pub fn update_stage(&mut self, result: &StageResult) {
        if let Some(slot) = self.stages.iter_mut().rev().find(|s| s.stage == result.stage) {
            slot.clone_from(result);
        }
    }

    pub fn complete(&mut self, now: Timestamp, output: Option<PathBuf>) -> Result<(), CoreError> {
        self.transition(PipelineState::Complete)?;
        self.output = output;
        self.ended_at = Some(now);
        Ok(())
    }

    pub fn fail(&mut self, now: Timestamp, failure: StageFailure) -> Result<(), CoreError> {
        self.transition(PipelineState::Failed)?;
        self.failure.get_or_insert(failure);
        self.ended_at = Some(now);
        Ok(())
    }

    pub fn cancel(&mut self, now: Timestamp) -> Result<(), CoreError> {
        self.transition(PipelineState::Cancelled)?;
        self.ended_at = Some(now);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
