//! Matrix fan-out and fan-in.
//!
//! Every platform runs its own leg task: provision → (emulation) → build → collect.
//! Tasks share only the read-only [`RunConfig`]; each returns its own [`LegResult`] and
//! the results are merged into a [`MatrixReport`] after all tasks have been joined.
//! A failing or panicking leg never cancels its siblings.

use super::collect::ArtifactCollector;
use super::dispatch::{ArgumentString, BuildCommand, CommandDispatcher};
use super::emulation::{EmulationPolicy, EmulationRegistrar, needs_emulation};
use super::error::LegError;
use super::leg::{LegResult, LegStatus, PlatformLeg};
use super::platform::Platform;
use super::provision::{EnvironmentProvisioner, SourceSettings};
use super::report::MatrixReport;
use crate::error::MatrixError;
use crate::utils::fs;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use uuid::Uuid;

/// Immutable parameters of one matrix invocation.
///
/// Built once from CLI flags and the matrix file, then shared read-only by every leg.
#[derive(Clone, Debug)]
pub struct RunConfig {
    pub platforms: Vec<Platform>,
    pub args: ArgumentString,
    /// Environment variable the build reads `args` from
    pub args_env: String,
    pub command: BuildCommand,
    pub source: SourceSettings,
    pub patterns: Vec<String>,
    pub output_dir: PathBuf,
    pub archive: bool,
    pub emulation: EmulationPolicy,
    /// Per-leg time budget for the build command
    pub timeout: Option<Duration>,
    pub work_root: PathBuf,
    /// Maximum concurrently running legs; `None` runs every leg at once
    pub max_parallel: Option<usize>,
    pub keep_workdirs: bool,
}

/// Runs every leg of the matrix and aggregates their outcomes.
pub struct MatrixOrchestrator {
    config: Arc<RunConfig>,
    registrar: Arc<dyn EmulationRegistrar>,
}

impl std::fmt::Debug for MatrixOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatrixOrchestrator")
            .field("config", &self.config)
            .field("registrar", &"<EmulationRegistrar>")
            .finish()
    }
}

impl MatrixOrchestrator {
    pub fn new(config: RunConfig, registrar: Arc<dyn EmulationRegistrar>) -> Self {
        Self {
            config: Arc::new(config),
            registrar,
        }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Runs all legs to completion.
    ///
    /// Only setup of the shared run directory can fail the call itself; everything that
    /// goes wrong inside a leg is reported through that leg's result.
    pub async fn run(&self) -> Result<MatrixReport, MatrixError> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4().to_string();
        let run_dir = self.config.work_root.join(format!("run-{}", run_id));
        fs::create_dir_all(&run_dir, false).await?;
        let run_dir = Arc::new(run_dir);

        log::info!(
            "Starting matrix run {} with {} leg(s) in {}",
            run_id,
            self.config.platforms.len(),
            run_dir.display()
        );

        let semaphore = self
            .config
            .max_parallel
            .map(|n| Arc::new(Semaphore::new(n.max(1))));

        let mut handles = Vec::with_capacity(self.config.platforms.len());
        for platform in &self.config.platforms {
            let config = Arc::clone(&self.config);
            let registrar = Arc::clone(&self.registrar);
            let run_dir = Arc::clone(&run_dir);
            let run_id = run_id.clone();
            let semaphore = semaphore.clone();
            let leg_platform = platform.clone();

            let handle = tokio::spawn(async move {
                // Permit is released when the leg finishes
                let _permit = match semaphore {
                    Some(semaphore) => semaphore.acquire_owned().await.ok(),
                    None => None,
                };
                run_leg(leg_platform, &config, registrar.as_ref(), &run_id, &run_dir).await
            });
            handles.push((platform.clone(), handle));
        }

        let mut results = Vec::with_capacity(handles.len());
        for (platform, handle) in handles {
            match handle.await {
                Ok(result) => results.push(result),
                Err(e) => {
                    log::error!("[{}] Leg task died: {}", platform.id, e);
                    results.push(LegResult::internal_failure(
                        platform,
                        format!("leg task terminated unexpectedly: {}", e),
                    ));
                }
            }
        }

        if results.iter().all(|r| r.work_dir.is_none()) {
            if let Err(e) = fs::remove_dir_all(&run_dir).await {
                log::warn!("Failed to remove run directory {}: {}", run_dir.display(), e);
            }
        }

        let report = MatrixReport::new(run_id, self.config.args.clone(), started_at, results);
        log::info!(
            "Matrix run {} finished: {} of {} leg(s) succeeded",
            report.run_id,
            report.legs.values().filter(|l| l.succeeded()).count(),
            report.legs.len()
        );
        Ok(report)
    }
}

/// Runs one leg through its pipeline and freezes the result.
async fn run_leg(
    platform: Platform,
    config: &RunConfig,
    registrar: &dyn EmulationRegistrar,
    run_id: &str,
    run_dir: &Path,
) -> LegResult {
    let mut leg = PlatformLeg::new(platform);
    let collector = ArtifactCollector::new(
        config.patterns.clone(),
        config.output_dir.clone(),
        config.archive,
    );
    let provisioner = EnvironmentProvisioner::new(
        &config.source,
        run_dir,
        vec![config.work_root.clone(), config.output_dir.clone()],
    );

    match drive(&mut leg, config, registrar, run_id, &provisioner, &collector).await {
        Ok(()) => {
            leg.advance(LegStatus::Succeeded);
            if config.keep_workdirs {
                leg.set_work_dir(Some(provisioner.work_dir(leg.id())));
            } else {
                provisioner.cleanup(leg.id()).await;
            }
        }
        Err(error) => {
            if leg.status() == LegStatus::Collecting {
                // Never leave a half-staged leg behind
                if let Err(e) = collector.reset(leg.id()).await {
                    log::warn!("[{}] Failed to clear partial staging: {}", leg.id(), e);
                }
            }
            let work_dir = provisioner.work_dir(leg.id());
            let provisioned = leg.status() > LegStatus::Provisioning;
            leg.fail(error);
            if provisioned || work_dir.exists() {
                leg.set_work_dir(Some(work_dir));
            }
        }
    }

    leg.finish()
}

async fn drive(
    leg: &mut PlatformLeg,
    config: &RunConfig,
    registrar: &dyn EmulationRegistrar,
    run_id: &str,
    provisioner: &EnvironmentProvisioner<'_>,
    collector: &ArtifactCollector,
) -> Result<(), LegError> {
    let platform = leg.platform().clone();

    leg.advance(LegStatus::Provisioning);
    collector.reset(&platform.id).await?;
    provisioner.check_prerequisites(&platform, &config.command)?;
    let work_dir = provisioner.provision(&platform).await?;

    if needs_emulation(&platform, &config.emulation) {
        leg.advance(LegStatus::EmulationSetup);
        registrar.register(&platform, &config.emulation).await?;
        leg.mark_emulation_registered();
    }

    leg.advance(LegStatus::Building);
    let dispatcher = CommandDispatcher::new(
        run_id,
        &config.command,
        &config.args,
        &config.args_env,
        config.timeout,
    );
    let (output, error) = dispatcher.run(&platform, &work_dir).await;
    leg.set_output(output);
    if let Some(error) = error {
        return Err(error);
    }

    leg.advance(LegStatus::Collecting);
    let collected = collector.collect(&platform.id, &work_dir).await?;
    log::info!(
        "[{}] Collected {} artifact(s)",
        platform.id,
        collected.artifacts.len()
    );
    leg.set_artifacts(collected.artifacts);
    if let Some(bundle) = collected.bundle {
        leg.set_bundle(bundle);
    }

    Ok(())
}
