//! Working tree and prerequisite preparation for one leg.

use super::dispatch::BuildCommand;
use super::error::{IoContext, LegError, Result};
use super::platform::{Os, Platform, Runner};
use crate::source::RepositorySource;
use crate::utils::fs;
use std::path::{Path, PathBuf};

/// Where sources come from and how deep to fetch them.
#[derive(Clone, Debug)]
pub struct SourceSettings {
    pub repository: RepositorySource,
    pub git_ref: Option<String>,
    /// Also fetch nested submodules
    pub recursive: bool,
}

/// Prepares clean per-leg working trees under `<run_dir>/<platform-id>/src`.
#[derive(Debug)]
pub struct EnvironmentProvisioner<'a> {
    source: &'a SourceSettings,
    run_dir: &'a Path,
    /// Paths never copied from a local source (work root, output directory)
    exclude: Vec<PathBuf>,
}

impl<'a> EnvironmentProvisioner<'a> {
    pub fn new(source: &'a SourceSettings, run_dir: &'a Path, exclude: Vec<PathBuf>) -> Self {
        Self {
            source,
            run_dir,
            exclude,
        }
    }

    /// Working tree location for a leg.
    pub fn work_dir(&self, id: &str) -> PathBuf {
        self.run_dir.join(id).join("src")
    }

    /// Verifies the leg can execute `command` on this host.
    pub fn check_prerequisites(&self, platform: &Platform, command: &BuildCommand) -> Result<()> {
        if !platform.runs_on_host() {
            return Err(LegError::prerequisite(format!(
                "{} legs cannot run on a {} host with the {} runner",
                platform.os,
                Os::host(),
                match platform.runner {
                    Runner::Native => "native",
                    Runner::Container { .. } => "container",
                }
            )));
        }

        match &platform.runner {
            Runner::Native => {
                // Relative programs are resolved after acquisition, inside the tree
                if Path::new(&command.program).components().count() == 1 {
                    command.resolve_program(self.run_dir)?;
                }
            }
            Runner::Container { .. } => {
                which::which("docker").map_err(|e| {
                    LegError::prerequisite(format!("docker is required for container legs: {}", e))
                })?;
            }
        }
        Ok(())
    }

    /// Creates a fresh working tree for the leg and fills it with sources.
    pub async fn provision(&self, platform: &Platform) -> Result<PathBuf> {
        let work_dir = self.work_dir(&platform.id);
        fs::create_dir_all(&work_dir, true)
            .await
            .acquisition_context("preparing working tree", &work_dir)?;

        log::info!(
            "[{}] Acquiring sources into {}",
            platform.id,
            work_dir.display()
        );
        self.source
            .repository
            .acquire(
                &work_dir,
                self.source.git_ref.as_deref(),
                self.source.recursive,
                &self.exclude,
            )
            .await?;

        Ok(work_dir)
    }

    /// Removes a leg's working area; failures are only logged.
    pub async fn cleanup(&self, id: &str) {
        let leg_dir = self.run_dir.join(id);
        log::debug!("[{}] Cleaning up {}", id, leg_dir.display());
        if let Err(e) = fs::remove_dir_all(&leg_dir).await {
            log::warn!(
                "[{}] Failed to cleanup working tree {}: {}",
                id,
                leg_dir.display(),
                e
            );
        }
    }
}
