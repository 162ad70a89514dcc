//! Render pipeline orchestration.
//!
//! Runs the external tools that make up a render pipeline (renderer,
//! denoiser, upscaler, frame interpolator, encoder) one stage at a time,
//! turning their output into live progress and a final [`PipelineRun`].
//!
//! [`PipelineRun`]: lumen_core::run::PipelineRun

pub mod command;
pub mod error;
pub mod executor;
pub mod orchestrator;
pub mod probe;
pub mod settings;
pub mod sink;
pub mod subprocess;
pub mod tools;
pub mod workspace;
