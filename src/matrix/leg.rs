//! Per-platform leg state and results.

use super::error::LegError;
use super::platform::Platform;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Pipeline stage a leg is in.
///
/// Legs move forward through the stages in declaration order (skipping
/// `EmulationSetup` when the gate does not apply) and end in `Succeeded` or `Failed`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LegStatus {
    Pending,
    Provisioning,
    EmulationSetup,
    Building,
    Collecting,
    Succeeded,
    Failed,
}

impl LegStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LegStatus::Succeeded | LegStatus::Failed)
    }
}

impl fmt::Display for LegStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LegStatus::Pending => "pending",
            LegStatus::Provisioning => "provisioning",
            LegStatus::EmulationSetup => "emulation-setup",
            LegStatus::Building => "building",
            LegStatus::Collecting => "collecting",
            LegStatus::Succeeded => "succeeded",
            LegStatus::Failed => "failed",
        })
    }
}

/// Output captured from the build command.
#[derive(Clone, Debug, Default, Serialize)]
pub struct CapturedOutput {
    /// `None` when the process was killed by a signal, timed out or never started
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CapturedOutput {
    /// Last `n` lines of stderr, falling back to stdout when stderr is empty.
    pub fn tail(&self, n: usize) -> Vec<&str> {
        let source = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        let lines: Vec<&str> = source.lines().collect();
        lines[lines.len().saturating_sub(n)..].to_vec()
    }
}

/// One staged artifact.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Artifact {
    pub file_name: String,
    pub path: PathBuf,
    pub size: u64,
    pub sha256: String,
}

/// Artifacts staged for one leg, keyed by file name.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ArtifactSet {
    entries: BTreeMap<String, Artifact>,
}

impl ArtifactSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an artifact. Returns the rejected artifact if its name is already staged.
    pub fn insert(&mut self, artifact: Artifact) -> Result<(), Artifact> {
        if self.entries.contains_key(&artifact.file_name) {
            return Err(artifact);
        }
        self.entries.insert(artifact.file_name.clone(), artifact);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Artifact> {
        self.entries.values()
    }

    pub fn total_size(&self) -> u64 {
        self.entries.values().map(|a| a.size).sum()
    }
}

/// Live state of a leg while its pipeline runs. Owned by exactly one task.
#[derive(Debug)]
pub struct PlatformLeg {
    platform: Platform,
    status: LegStatus,
    failed_stage: Option<LegStatus>,
    error: Option<LegError>,
    output: CapturedOutput,
    artifacts: ArtifactSet,
    emulation_registered: bool,
    work_dir: Option<PathBuf>,
    bundle: Option<PathBuf>,
    started_at: Option<DateTime<Utc>>,
}

impl PlatformLeg {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            status: LegStatus::Pending,
            failed_stage: None,
            error: None,
            output: CapturedOutput::default(),
            artifacts: ArtifactSet::new(),
            emulation_registered: false,
            work_dir: None,
            bundle: None,
            started_at: None,
        }
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    pub fn id(&self) -> &str {
        &self.platform.id
    }

    pub fn status(&self) -> LegStatus {
        self.status
    }

    /// Moves the leg to the next stage.
    ///
    /// Terminal legs and backwards moves are ignored (and logged), so a leg can never
    /// leave `Succeeded` or `Failed`.
    pub fn advance(&mut self, next: LegStatus) -> bool {
        if self.status.is_terminal() || next <= self.status || next == LegStatus::Failed {
            log::warn!(
                "[{}] ignoring transition {} -> {}",
                self.platform.id,
                self.status,
                next
            );
            return false;
        }
        if self.status == LegStatus::Pending {
            self.started_at = Some(Utc::now());
        }
        log::debug!("[{}] {} -> {}", self.platform.id, self.status, next);
        self.status = next;
        true
    }

    /// Marks the leg failed at its current stage.
    pub fn fail(&mut self, error: LegError) {
        if self.status.is_terminal() {
            log::warn!(
                "[{}] ignoring failure on terminal leg: {}",
                self.platform.id,
                error
            );
            return;
        }
        log::info!("[{}] failed during {}: {}", self.platform.id, self.status, error);
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        self.failed_stage = Some(self.status);
        self.error = Some(error);
        self.status = LegStatus::Failed;
    }

    pub fn set_output(&mut self, output: CapturedOutput) {
        self.output = output;
    }

    pub fn set_artifacts(&mut self, artifacts: ArtifactSet) {
        self.artifacts = artifacts;
    }

    pub fn set_bundle(&mut self, bundle: PathBuf) {
        self.bundle = Some(bundle);
    }

    pub fn set_work_dir(&mut self, work_dir: Option<PathBuf>) {
        self.work_dir = work_dir;
    }

    pub fn mark_emulation_registered(&mut self) {
        self.emulation_registered = true;
    }

    /// Freezes the leg into its reportable result.
    pub fn finish(self) -> LegResult {
        let finished_at = Utc::now();
        let started_at = self.started_at.unwrap_or(finished_at);
        LegResult {
            platform: self.platform,
            status: self.status,
            failed_stage: self.failed_stage,
            error_kind: self.error.as_ref().map(|e| e.kind().to_string()),
            error: self.error.as_ref().map(|e| e.to_string()),
            output: self.output,
            artifacts: self.artifacts,
            bundle: self.bundle,
            emulation_registered: self.emulation_registered,
            work_dir: self.work_dir,
            started_at,
            finished_at,
            duration_ms: (finished_at - started_at).num_milliseconds().max(0) as u64,
        }
    }
}

/// Final, read-only outcome of a leg.
#[derive(Clone, Debug, Serialize)]
pub struct LegResult {
    pub platform: Platform,
    pub status: LegStatus,
    pub failed_stage: Option<LegStatus>,
    pub error_kind: Option<String>,
    pub error: Option<String>,
    pub output: CapturedOutput,
    pub artifacts: ArtifactSet,
    /// Per-leg `.tar.gz` bundle, when archiving is enabled
    pub bundle: Option<PathBuf>,
    pub emulation_registered: bool,
    /// Working tree kept for diagnostics; `None` once cleaned up
    pub work_dir: Option<PathBuf>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl LegResult {
    pub fn succeeded(&self) -> bool {
        self.status == LegStatus::Succeeded
    }

    /// Result for a leg whose task died before it could report.
    pub fn internal_failure(platform: Platform, reason: String) -> Self {
        let mut leg = PlatformLeg::new(platform);
        leg.fail(LegError::Internal { reason });
        leg.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact(name: &str) -> Artifact {
        Artifact {
            file_name: name.to_string(),
            path: PathBuf::from("dist").join(name),
            size: 3,
            sha256: "00".repeat(32),
        }
    }

    #[test]
    fn leg_walks_forward_and_stops_at_terminal() {
        let mut leg = PlatformLeg::new(Platform::from_id("ubuntu-latest"));
        assert!(leg.advance(LegStatus::Provisioning));
        assert!(leg.advance(LegStatus::Building));
        assert!(!leg.advance(LegStatus::Provisioning));
        assert!(leg.advance(LegStatus::Collecting));
        assert!(leg.advance(LegStatus::Succeeded));
        assert!(!leg.advance(LegStatus::Collecting));

        leg.fail(LegError::collection("late"));
        let result = leg.finish();
        assert!(result.succeeded());
        assert!(result.error.is_none());
    }

    #[test]
    fn failure_records_stage_and_kind() {
        let mut leg = PlatformLeg::new(Platform::from_id("windows-2019"));
        leg.advance(LegStatus::Provisioning);
        leg.advance(LegStatus::Building);
        leg.fail(LegError::BuildCommand {
            exit_code: Some(1),
            reason: "boom".to_string(),
        });
        assert!(!leg.advance(LegStatus::Collecting));

        let result = leg.finish();
        assert_eq!(result.status, LegStatus::Failed);
        assert_eq!(result.failed_stage, Some(LegStatus::Building));
        assert_eq!(result.error_kind.as_deref(), Some("build_command"));
        assert!(result.artifacts.is_empty());
    }

    #[test]
    fn artifact_set_rejects_duplicate_names() {
        let mut set = ArtifactSet::new();
        set.insert(artifact("x.whl")).unwrap();
        set.insert(artifact("a.tar.gz")).unwrap();
        assert!(set.insert(artifact("x.whl")).is_err());
        assert_eq!(set.names().collect::<Vec<_>>(), vec!["a.tar.gz", "x.whl"]);
        assert_eq!(set.total_size(), 6);
    }

    #[test]
    fn tail_prefers_stderr() {
        let output = CapturedOutput {
            exit_code: Some(1),
            stdout: "a\nb\n".to_string(),
            stderr: "e1\ne2\ne3\n".to_string(),
        };
        assert_eq!(output.tail(2), vec!["e2", "e3"]);
        let quiet = CapturedOutput {
            stderr: String::new(),
            ..output
        };
        assert_eq!(quiet.tail(5), vec!["a", "b"]);
    }
}
