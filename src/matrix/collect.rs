//! Artifact discovery and staging for succeeded legs.

use super::archive::bundle_directory;
use super::checksum::calculate_sha256;
use super::error::{IoContext, LegError, Result};
use super::leg::{Artifact, ArtifactSet};
use crate::utils::fs;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Default artifact patterns, relative to the leg's working tree
pub const DEFAULT_PATTERNS: &[&str] = &["wheelhouse/*.whl", "wheelhouse/*.tar.gz"];

/// Checksum manifest written next to staged artifacts
pub const CHECKSUM_MANIFEST: &str = "SHA256SUMS";

/// Artifacts staged for a leg, plus its bundle when archiving is on.
#[derive(Debug, Default)]
pub struct Collected {
    pub artifacts: ArtifactSet,
    pub bundle: Option<PathBuf>,
}

/// Stages files matching the configured patterns under `<output_dir>/<platform-id>/`.
#[derive(Clone, Debug)]
pub struct ArtifactCollector {
    patterns: Vec<String>,
    output_dir: PathBuf,
    archive: bool,
}

impl ArtifactCollector {
    /// Creates a new artifact collector.
    ///
    /// # Arguments
    ///
    /// * `patterns` - Glob patterns relative to each leg's working tree
    /// * `output_dir` - Root of the per-leg staging directories (should be absolute)
    /// * `archive` - Also pack each leg into `<output_dir>/<platform-id>.tar.gz`
    pub fn new(patterns: Vec<String>, output_dir: PathBuf, archive: bool) -> Self {
        Self {
            patterns,
            output_dir,
            archive,
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Staging directory for one leg.
    pub fn stage_dir(&self, id: &str) -> PathBuf {
        self.output_dir.join(id)
    }

    /// Bundle archive path for one leg.
    pub fn bundle_path(&self, id: &str) -> PathBuf {
        self.output_dir.join(format!("{}.tar.gz", id))
    }

    /// Clears anything a previous run staged for this leg.
    pub async fn reset(&self, id: &str) -> Result<()> {
        let stage_dir = self.stage_dir(id);
        fs::remove_dir_all(&stage_dir)
            .await
            .collection_context("clearing staging directory", &stage_dir)?;
        let bundle = self.bundle_path(id);
        fs::remove_file(&bundle)
            .await
            .collection_context("removing stale bundle", &bundle)?;
        Ok(())
    }

    /// Regular files in `work_dir` matching any pattern, deduplicated and sorted.
    pub async fn discover(&self, work_dir: &Path) -> Result<Vec<PathBuf>> {
        let work_dir = work_dir.to_path_buf();
        let patterns = self.patterns.clone();

        tokio::task::spawn_blocking(move || {
            let root = glob::Pattern::escape(&work_dir.to_string_lossy());
            let mut found = BTreeSet::new();

            for pattern in &patterns {
                let full = format!("{}/{}", root, pattern.trim_start_matches("./"));
                let paths = glob::glob(&full).map_err(|e| {
                    LegError::collection(format!("invalid artifact pattern '{}': {}", pattern, e))
                })?;

                for entry in paths {
                    let path = entry.map_err(|e| {
                        LegError::collection(format!("cannot read match for '{}': {}", pattern, e))
                    })?;
                    let metadata = std::fs::symlink_metadata(&path)
                        .collection_context("reading metadata for", &path)?;
                    if metadata.is_file() {
                        found.insert(path);
                    } else {
                        log::debug!("Skipping non-regular match: {}", path.display());
                    }
                }
            }

            Ok(found.into_iter().collect())
        })
        .await
        .map_err(|e| LegError::collection(format!("artifact discovery task panicked: {}", e)))?
    }

    /// Copies matching artifacts into the leg's staging directory.
    ///
    /// Zero matches is not an error: the leg simply publishes an empty set.
    pub async fn collect(&self, id: &str, work_dir: &Path) -> Result<Collected> {
        let matches = self.discover(work_dir).await?;
        if matches.is_empty() {
            log::warn!(
                "[{}] No artifacts matched {:?} in {}",
                id,
                self.patterns,
                work_dir.display()
            );
            return Ok(Collected::default());
        }

        let stage_dir = self.stage_dir(id);
        fs::create_dir_all(&stage_dir, true)
            .await
            .collection_context("creating staging directory", &stage_dir)?;

        let mut artifacts = ArtifactSet::new();
        for source in matches {
            let file_name = source
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| LegError::collection(format!("artifact has no file name: {}", source.display())))?;

            let dest = stage_dir.join(&file_name);
            if artifacts.names().any(|n| n == file_name) {
                return Err(LegError::collection(format!(
                    "two artifacts named '{}' in one leg (second: {})",
                    file_name,
                    source.display()
                )));
            }

            let size = fs::copy_file(&source, &dest)
                .await
                .collection_context("staging artifact", &source)?;
            let sha256 = calculate_sha256(&dest)
                .await
                .collection_context("hashing artifact", &dest)?;

            log::info!("[{}] ✓ Artifact: {} ({} bytes)", id, file_name, size);
            let artifact = Artifact {
                file_name,
                path: dest,
                size,
                sha256,
            };
            if let Err(rejected) = artifacts.insert(artifact) {
                return Err(LegError::collection(format!(
                    "duplicate artifact '{}'",
                    rejected.file_name
                )));
            }
        }

        let manifest: String = artifacts
            .iter()
            .map(|a| format!("{}  {}\n", a.sha256, a.file_name))
            .collect();
        let manifest_path = stage_dir.join(CHECKSUM_MANIFEST);
        tokio::fs::write(&manifest_path, manifest)
            .await
            .collection_context("writing checksum manifest", &manifest_path)?;

        let bundle = if self.archive {
            let target = self.bundle_path(id);
            let bundle = bundle_directory(&stage_dir, &target, id)
                .await
                .collection_context("writing bundle", &target)?;
            log::info!("[{}] Bundled artifacts into {}", id, bundle.display());
            Some(bundle)
        } else {
            None
        };

        Ok(Collected { artifacts, bundle })
    }
}
