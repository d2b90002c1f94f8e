//! Leg-local failures.
//!
//! A [`LegError`] terminates the leg that produced it and nothing else. The orchestrator
//! records it in the leg's result; sibling legs keep running.

use crate::utils::duration::humanize_duration;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for leg pipeline stages
pub type Result<T> = std::result::Result<T, LegError>;

#[derive(Error, Debug, Clone)]
pub enum LegError {
    /// Source retrieval failed (missing path, clone failure, missing submodule)
    #[error("source acquisition failed: {reason}")]
    Acquisition { reason: String },

    /// A required tool is missing or the leg cannot run on this host
    #[error("prerequisite check failed: {reason}")]
    Prerequisite { reason: String },

    /// Foreign-architecture handlers could not be registered
    #[error("emulation setup failed: {reason}")]
    EmulationSetup { reason: String },

    /// Build command exited non-zero or could not be spawned
    #[error("build command failed{}: {reason}", exit_code.map(|c| format!(" with exit code {}", c)).unwrap_or_default())]
    BuildCommand {
        exit_code: Option<i32>,
        reason: String,
    },

    /// Build command exceeded the per-leg time budget
    #[error("build command timed out after {}", humanize_duration(*limit))]
    Timeout { limit: Duration },

    /// Artifact staging failed
    #[error("artifact collection failed: {reason}")]
    Collection { reason: String },

    /// The leg's task panicked or was cancelled
    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl LegError {
    /// Stable identifier used in JSON reports.
    pub fn kind(&self) -> &'static str {
        match self {
            LegError::Acquisition { .. } => "acquisition",
            LegError::Prerequisite { .. } => "prerequisite",
            LegError::EmulationSetup { .. } => "emulation_setup",
            LegError::BuildCommand { .. } => "build_command",
            LegError::Timeout { .. } => "timeout",
            LegError::Collection { .. } => "collection",
            LegError::Internal { .. } => "internal",
        }
    }

    pub fn acquisition(reason: impl Into<String>) -> Self {
        LegError::Acquisition {
            reason: reason.into(),
        }
    }

    pub fn prerequisite(reason: impl Into<String>) -> Self {
        LegError::Prerequisite {
            reason: reason.into(),
        }
    }

    pub fn collection(reason: impl Into<String>) -> Self {
        LegError::Collection {
            reason: reason.into(),
        }
    }
}

/// Attaches an operation and path to I/O errors, mapping them into a leg error.
pub trait IoContext<T> {
    fn acquisition_context(self, action: &str, path: &Path) -> Result<T>;
    fn collection_context(self, action: &str, path: &Path) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn acquisition_context(self, action: &str, path: &Path) -> Result<T> {
        self.map_err(|e| LegError::acquisition(format!("{} {}: {}", action, path.display(), e)))
    }

    fn collection_context(self, action: &str, path: &Path) -> Result<T> {
        self.map_err(|e| LegError::collection(format!("{} {}: {}", action, path.display(), e)))
    }
}
