//! `lumen-worker` -- runs one render pipeline job.
//!
//! Loads a JSON run configuration, runs every configured stage with the
//! external tools found on this host and prints a JSON report on stdout.
//! Ctrl-C cancels the run. Exits non-zero unless the run succeeded.
//!
//! # Environment variables
//!
//! | Variable              | Required | Default | Description                          |
//! |-----------------------|----------|---------|--------------------------------------|
//! | `LUMEN_RUN_CONFIG`    | yes      | --      | Path of the run configuration JSON   |
//! | `LUMEN_ESTIMATE_ONLY` | no       | `false` | Estimate render time instead of run  |
//!
//! Tool locations (`BLENDER_PATH`, `FFMPEG_PATH`, ...) and pipeline
//! tunables (`LUMEN_*_TIMEOUT_SECS`, ...) are read as well.

use std::sync::Arc;

use lumen_core::run::RunStatus;
use lumen_gpu::collector::NvmlProbe;
use lumen_pipeline::orchestrator::Orchestrator;
use lumen_pipeline::settings::PipelineSettings;
use lumen_pipeline::sink::TracingSink;
use lumen_pipeline::tools::{ToolCommandBuilder, ToolPaths};
use lumen_worker::{load_run_configuration, Report, WorkerConfig, WorkerError};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lumen_worker=info,lumen_pipeline=info,lumen_gpu=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = run().await {
        tracing::error!(error = %e, "Worker failed");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), WorkerError> {
    let worker = WorkerConfig::from_env()?;
    let settings = PipelineSettings::from_env()?;
    let config = load_run_configuration(&worker.run_config)?;

    let orchestrator = Orchestrator::new(
        Arc::new(ToolCommandBuilder::new(ToolPaths::from_env())),
        Arc::new(NvmlProbe::new()),
        Arc::new(TracingSink),
        settings,
    );

    let canceller = orchestrator.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, cancelling");
            canceller.cancel();
        }
    });

    if worker.estimate_only {
        let estimate = orchestrator.estimate(&config).await?;
        println!("{}", Report::Estimate(&estimate).to_json()?);
        return Ok(());
    }

    tracing::info!(
        config = %worker.run_config.display(),
        scene = %config.scene_file.display(),
        "Worker starting"
    );
    let run = orchestrator.run(config).await?;
    let status = run.status();
    println!("{}", Report::Run { status, run: &run }.to_json()?);

    match status {
        RunStatus::Succeeded => Ok(()),
        other => Err(WorkerError::RunUnsuccessful(other)),
    }
}
