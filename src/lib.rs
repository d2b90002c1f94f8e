//! Cross-platform build matrix dispatcher.
//!
//! Runs one build per platform, each in its own clean working tree, passes a single
//! opaque argument string to every build, and collects the packaged outputs of each
//! successful leg under a per-platform directory.
//!
//! It can be used both as a CLI tool and as a library dependency; see [`matrix`] for
//! the engine and [`config`] for building a [`matrix::RunConfig`].

pub mod cli;
pub mod config;
pub mod error;
pub mod matrix;
pub mod source;
pub mod utils;

// Re-export commonly used types
pub use error::{CliError, MatrixError, Result};
