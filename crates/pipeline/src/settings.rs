use std::str::FromStr;
use std::time::Duration;

use lumen_core::device::DEFAULT_MEMORY_THRESHOLD;
use lumen_core::error::CoreError;
use lumen_core::estimation::DEFAULT_ESTIMATE_SAMPLES;
use lumen_core::stage::StageName;
use lumen_core::threshold_validation::{validate_positive, validate_unit_interval};

/// Per-invocation wall-clock budgets, by kind of tool.
#[derive(Debug, Clone, PartialEq)]
pub struct StageTimeouts {
    /// One renderer invocation covering the whole frame range.
    pub render: Duration,
    /// One per-frame tool invocation (denoisers).
    pub frame_tool: Duration,
    /// One whole-sequence tool invocation (upscaler, interpolator).
    pub sequence_tool: Duration,
    pub encode: Duration,
}

impl StageTimeouts {
    pub fn for_stage(&self, stage: StageName) -> Duration {
        match stage {
            StageName::Render => self.render,
            StageName::Denoise => self.frame_tool,
            StageName::Upscale | StageName::Interpolate => self.sequence_tool,
            StageName::Encode => self.encode,
        }
    }
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            render: Duration::from_secs(86_400),
            frame_tool: Duration::from_secs(120),
            sequence_tool: Duration::from_secs(7_200),
            encode: Duration::from_secs(3_600),
        }
    }
}

/// Orchestrator tunables loaded from environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    pub timeouts: StageTimeouts,
    /// Time a cancelled tool gets to exit after the polite signal.
    pub cancel_grace: Duration,
    /// Cadence for output-file polling.
    pub poll_interval: Duration,
    /// Fraction of device memory a workload may claim.
    pub memory_threshold: f64,
    /// Sample cap for the estimate test frame.
    pub estimate_samples: u32,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            timeouts: StageTimeouts::default(),
            cancel_grace: Duration::from_secs(10),
            poll_interval: Duration::from_millis(250),
            memory_threshold: DEFAULT_MEMORY_THRESHOLD,
            estimate_samples: DEFAULT_ESTIMATE_SAMPLES,
        }
    }
}

impl PipelineSettings {
    /// Load settings from environment variables with defaults.
    ///
    /// | Env Var                            | Default |
    /// |------------------------------------|---------|
    /// | `LUMEN_RENDER_TIMEOUT_SECS`        | `86400` |
    /// | `LUMEN_FRAME_TOOL_TIMEOUT_SECS`    | `120`   |
    /// | `LUMEN_SEQUENCE_TOOL_TIMEOUT_SECS` | `7200`  |
    /// | `LUMEN_ENCODE_TIMEOUT_SECS`        | `3600`  |
    /// | `LUMEN_CANCEL_GRACE_SECS`          | `10`    |
    /// | `LUMEN_POLL_INTERVAL_MS`           | `250`   |
    /// | `LUMEN_GPU_MEMORY_THRESHOLD`       | `0.8`   |
    /// | `LUMEN_ESTIMATE_SAMPLES`           | `32`    |
    pub fn from_env() -> Result<Self, CoreError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) but reading from `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, CoreError> {
        let defaults = Self::default();

        let secs = |key: &str, default: Duration| -> Result<Duration, CoreError> {
            match parse_var::<u64>(&lookup, key)? {
                Some(value) => {
                    validate_positive(value, key)?;
                    Ok(Duration::from_secs(value))
                }
                None => Ok(default),
            }
        };

        let timeouts = StageTimeouts {
            render: secs("LUMEN_RENDER_TIMEOUT_SECS", defaults.timeouts.render)?,
            frame_tool: secs("LUMEN_FRAME_TOOL_TIMEOUT_SECS", defaults.timeouts.frame_tool)?,
            sequence_tool: secs(
                "LUMEN_SEQUENCE_TOOL_TIMEOUT_SECS",
                defaults.timeouts.sequence_tool,
            )?,
            encode: secs("LUMEN_ENCODE_TIMEOUT_SECS", defaults.timeouts.encode)?,
        };

        // A zero grace period means "kill immediately".
        let cancel_grace = parse_var::<u64>(&lookup, "LUMEN_CANCEL_GRACE_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.cancel_grace);

        let poll_interval = match parse_var::<u64>(&lookup, "LUMEN_POLL_INTERVAL_MS")? {
            Some(ms) => {
                validate_positive(ms, "LUMEN_POLL_INTERVAL_MS")?;
                Duration::from_millis(ms)
            }
            None => defaults.poll_interval,
        };

        let memory_threshold = parse_var::<f64>(&lookup, "LUMEN_GPU_MEMORY_THRESHOLD")?
            .unwrap_or(defaults.memory_threshold);
        validate_unit_interval(memory_threshold, "LUMEN_GPU_MEMORY_THRESHOLD")?;

        let estimate_samples = match parse_var::<u32>(&lookup, "LUMEN_ESTIMATE_SAMPLES")? {
            Some(n) => {
                validate_positive(u64::from(n), "LUMEN_ESTIMATE_SAMPLES")?;
                n
            }
            None => defaults.estimate_samples,
        };

        Ok(Self {
            timeouts,
            cancel_grace,
            poll_interval,
            memory_threshold,
            estimate_samples,
        })
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, CoreError> {
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| CoreError::Configuration(format!("{key} has an invalid value: {raw:?}"))),
        _ => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
