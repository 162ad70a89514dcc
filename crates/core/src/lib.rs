//! Render pipeline domain logic.
//!
//! Everything in this crate is pure: configuration validation, device
//! scoring, output-line parsing, progress accounting, the stage/run data
//! model and estimate arithmetic. Subprocesses and the filesystem live in
//! `lumen-pipeline`.

pub mod config;
pub mod device;
pub mod error;
pub mod estimation;
pub mod progress;
pub mod run;
pub mod stage;
pub mod threshold_validation;
pub mod types;
