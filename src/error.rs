//! Run-level error types for the matrix dispatcher.
//!
//! Errors in this module abort the whole invocation (bad arguments, unreadable config,
//! report I/O). Failures inside a single platform leg are modelled by
//! [`crate::matrix::LegError`] and never surface here.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for run-level operations
pub type Result<T> = std::result::Result<T, MatrixError>;

/// Main error type for run-level operations
#[derive(Error, Debug)]
pub enum MatrixError {
    /// CLI argument errors
    #[error("CLI error: {0}")]
    Cli(#[from] CliError),

    /// Matrix configuration errors
    #[error("Configuration error in {}: {reason}", path.as_ref().map(|p| p.display().to_string()).unwrap_or_else(|| "<command line>".to_string()))]
    Config {
        /// Config file that produced the error, if any
        path: Option<PathBuf>,
        /// Reason for the error
        reason: String,
    },

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing errors
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Run-level failures carrying a context chain (report output, working directory)
    #[error("{0:#}")]
    Anyhow(#[from] anyhow::Error),
}

/// CLI-specific errors
#[derive(Error, Debug)]
pub enum CliError {
    /// Invalid command line arguments
    #[error("Invalid arguments: {reason}")]
    InvalidArguments {
        /// Reason for the error
        reason: String,
    },

    /// Missing required argument
    #[error("Missing required argument: {argument}")]
    MissingArgument {
        /// Argument name
        argument: String,
    },
}

impl MatrixError {
    /// Shorthand for a configuration error without a backing file.
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            path: None,
            reason: reason.into(),
        }
    }

    /// Get actionable recovery suggestions for this error
    pub fn recovery_suggestions(&self) -> Vec<String> {
        match self {
            Self::Config { .. } | Self::Toml(_) => vec![
                "Check the matrix file against the documented [build], [source], [artifacts] and [[platform]] tables".to_string(),
            ],
            Self::Cli(CliError::MissingArgument { argument }) => vec![format!(
                "Pass {} on the command line or set it in the matrix file",
                argument
            )],
            Self::Anyhow(_) | Self::Io(_) => vec![
                "Check that the report path and working directories are writable".to_string(),
            ],
            _ => vec!["Check the error message above for specific details".to_string()],
        }
    }
}
