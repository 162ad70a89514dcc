//! Command-line front end: loads one run configuration, runs it (or
//! estimates it) and reports the outcome.

use std::path::{Path, PathBuf};

use lumen_core::config::RunConfiguration;
use lumen_core::error::CoreError;
use lumen_core::estimation::RenderEstimate;
use lumen_core::run::{PipelineRun, RunStatus};
use lumen_pipeline::error::PipelineError;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("Cannot read run configuration {}: {source}", path.display())]
    ReadConfig {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid run configuration {}: {source}", path.display())]
    ParseConfig {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to serialize report: {0}")]
    Report(#[from] serde_json::Error),

    #[error("Pipeline run ended {0:?}")]
    RunUnsuccessful(RunStatus),
}

/// Worker options loaded from environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    /// JSON file holding the [`RunConfiguration`].
    pub run_config: PathBuf,
    /// Only estimate the render time; launch nothing else.
    pub estimate_only: bool,
}

impl WorkerConfig {
    /// | Env Var               | Required | Default |
    /// |-----------------------|----------|---------|
    /// | `LUMEN_RUN_CONFIG`    | yes      | --      |
    /// | `LUMEN_ESTIMATE_ONLY` | no       | `false` |
    pub fn from_env() -> Result<Self, CoreError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, CoreError> {
        let run_config = lookup("LUMEN_RUN_CONFIG")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .ok_or_else(|| {
                CoreError::Configuration("LUMEN_RUN_CONFIG environment variable is required".into())
            })?;

        let estimate_only = match lookup("LUMEN_ESTIMATE_ONLY").as_deref().map(str::trim) {
            None | Some("") | Some("0") | Some("false") => false,
            Some("1") | Some("true") => true,
            Some(other) => {
                return Err(CoreError::Configuration(format!(
                    "LUMEN_ESTIMATE_ONLY must be true or false, got {other:?}"
                )))
            }
        };

        Ok(Self {
            run_config,
            estimate_only,
        })
    }
}

/// Read and validate a run configuration file.
pub fn load_run_configuration(path: &Path) -> Result<RunConfiguration, WorkerError> {
    let raw = std::fs::read_to_string(path).map_err(|source| WorkerError::ReadConfig {
        path: path.to_path_buf(),
        source,
    })?;
    let config: RunConfiguration =
        serde_json::from_str(&raw).map_err(|source| WorkerError::ParseConfig {
            path: path.to_path_buf(),
            source,
        })?;
    config.validate()?;
    Ok(config)
}

/// Machine-readable outcome printed on stdout.
#[derive(Debug, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Report<'a> {
    Run {
        status: RunStatus,
        #[serde(flatten)]
        run: &'a PipelineRun,
    },
    Estimate(&'a RenderEstimate),
}

impl Report<'_> {
    pub fn to_json(&self) -> Result<String, WorkerError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use assert_matches::assert_matches;
    use lumen_core::config::{DenoiseMethod, DevicePreference};

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn run_config_is_required() {
        assert_matches!(
            WorkerConfig::from_lookup(lookup(&[])),
            Err(CoreError::Configuration(msg)) if msg.contains("LUMEN_RUN_CONFIG")
        );
    }

    #[test]
    fn estimate_flag_parses() {
        let config = WorkerConfig::from_lookup(lookup(&[
            ("LUMEN_RUN_CONFIG", "/jobs/shot.json"),
            ("LUMEN_ESTIMATE_ONLY", "true"),
        ]))
        .unwrap();
        assert_eq!(config.run_config, PathBuf::from("/jobs/shot.json"));
        assert!(config.estimate_only);

        let result = WorkerConfig::from_lookup(lookup(&[
            ("LUMEN_RUN_CONFIG", "/jobs/shot.json"),
            ("LUMEN_ESTIMATE_ONLY", "maybe"),
        ]));
        assert!(result.is_err());
    }

    fn write_json(body: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::Builder::new()
            .suffix(".json")
            .tempfile()
            .expect("create temp file");
        write!(f, "{body}").expect("write body");
        f
    }

    #[test]
    fn loads_configuration_with_defaults() {
        let file = write_json(
            r#"{
                "scene_file": "/scenes/shot.blend",
                "frame_start": 1,
                "frame_end": 24,
                "resolution": { "width": 1920, "height": 1080 },
                "sample_count": 128,
                "device": { "device": 1 },
                "output_root": "/renders/shot"
            }"#,
        );
        let config = load_run_configuration(file.path()).unwrap();
        assert_eq!(config.frame_count(), 24);
        assert_eq!(config.device, DevicePreference::Device(1));
        assert_eq!(config.denoise, DenoiseMethod::Oidn);
        assert_eq!(config.framerate, 30);
    }

    #[test]
    fn invalid_configuration_is_rejected() {
        let file = write_json(
            r#"{
                "scene_file": "/scenes/shot.blend",
                "frame_start": 10,
                "frame_end": 1,
                "resolution": { "width": 1920, "height": 1080 },
                "sample_count": 128,
                "output_root": "/renders/shot"
            }"#,
        );
        assert_matches!(
            load_run_configuration(file.path()),
            Err(WorkerError::Core(CoreError::Configuration(_)))
        );
    }

    #[test]
    fn malformed_json_is_parse_error() {
        let file = write_json("{ not json");
        assert_matches!(
            load_run_configuration(file.path()),
            Err(WorkerError::ParseConfig { .. })
        );
    }

    #[test]
    fn missing_file_is_read_error() {
        assert_matches!(
            load_run_configuration(Path::new("/nonexistent/run.json")),
            Err(WorkerError::ReadConfig { .. })
        );
    }

    #[test]
    fn run_report_is_tagged() {
        let run = PipelineRun::idle();
        let report = Report::Run {
            status: run.status(),
            run: &run,
        };
        let value: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(value["mode"], "run");
        assert_eq!(value["status"], "idle");
        assert_eq!(value["state"], "idle");
        assert!(value["stages"].as_array().unwrap().is_empty());
    }
}
