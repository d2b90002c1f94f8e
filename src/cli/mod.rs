//! Command line interface for the matrix dispatcher.

mod args;
mod output;

pub use args::{Args, RuntimeConfig};
pub use output::OutputManager;

use anyhow::Context;
use crate::config::{MatrixConfig, load_config};
use crate::error::{CliError, Result};
use crate::matrix::{
    DockerBinfmtRegistrar, EmulationRegistrar, MatrixOrchestrator, NoopRegistrar, RunConfig,
    Runner,
};
use path_absolutize::Absolutize;
use std::path::Path;
use std::sync::Arc;

/// Main CLI entry point. Returns the process exit code for a completed run.
pub async fn run() -> Result<i32> {
    let args = Args::parse_args();
    args.validate()
        .map_err(|reason| CliError::InvalidArguments { reason })?;
    let runtime = RuntimeConfig::from(&args);
    let config = resolve_run_config(&args)?;
    execute(config, &runtime, args.report.as_deref()).await
}

/// Loads the matrix file (if any) and merges command line overrides into it.
pub fn resolve_run_config(args: &Args) -> Result<RunConfig> {
    let cwd = std::env::current_dir().context("resolving the current directory")?;
    let (file, config_dir) = match &args.config {
        Some(path) => {
            let path = path.absolutize_from(&cwd)?.into_owned();
            let dir = path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| cwd.clone());
            (load_config(&path)?, dir)
        }
        None => (MatrixConfig::default(), cwd.clone()),
    };
    file.into_run_config(args.overrides(), &config_dir, &cwd)
}

/// Runs a resolved matrix, prints the summary and writes the optional JSON report.
pub async fn execute(config: RunConfig, runtime: &RuntimeConfig, report_path: Option<&Path>) -> Result<i32> {
    runtime.section("Build matrix")?;
    runtime.indent(&format!("command:  {}", config.command))?;
    runtime.indent(&format!("args:     {:?} (via ${})", config.args.as_str(), config.args_env))?;
    runtime.indent(&format!("output:   {}", config.output_dir.display()))?;
    for platform in &config.platforms {
        let runner = match &platform.runner {
            Runner::Native => "native".to_string(),
            Runner::Container { image } => format!("container {}", image),
        };
        runtime.progress(&format!(
            "{} ({}/{}, {})",
            platform.id, platform.os, platform.arch, runner
        ))?;
    }

    let registrar: Arc<dyn EmulationRegistrar> = if config.emulation.enabled {
        Arc::new(DockerBinfmtRegistrar)
    } else {
        Arc::new(NoopRegistrar)
    };
    let orchestrator = MatrixOrchestrator::new(config, registrar);
    let report = orchestrator.run().await?;

    for leg in report.failed_legs() {
        runtime.error(&format!(
            "{} failed: {}",
            leg.platform.id,
            leg.error.as_deref().unwrap_or("unknown error")
        ))?;
    }
    runtime.output().summary(&report)?;

    if let Some(path) = report_path {
        report
            .write_json(path)
            .await
            .with_context(|| format!("writing report {}", path.display()))?;
        runtime.verbose_println(&format!("Report written to {}", path.display()))?;
    }

    if report.succeeded {
        runtime.success(&format!(
            "Artifacts staged in {}",
            orchestrator.config().output_dir.display()
        ))?;
    } else if !runtime.is_verbose() {
        runtime.warn("Re-run with --verbose to see the output of failed legs")?;
    }

    Ok(report.exit_code())
}
