//! Progress extraction from external tool output.
//!
//! [`parser`] turns individual output lines into progress and diagnostic
//! events; [`tracker`] folds frame events into a monotonic frame count,
//! a capped percentage and a rolling ETA.

pub mod parser;
pub mod tracker;
