//! Build matrix engine.
//!
//! This module runs one independent pipeline ("leg") per platform and aggregates the
//! results:
//!
//! 1. [`EnvironmentProvisioner`] prepares a clean working tree and checks prerequisites
//! 2. [`needs_emulation`] decides whether the leg registers foreign-architecture handlers
//! 3. [`CommandDispatcher`] runs the build with the argument bundle in its environment
//! 4. [`ArtifactCollector`] stages matching outputs under `<output_dir>/<platform-id>/`
//!
//! [`MatrixOrchestrator`] fans the legs out as tokio tasks and folds their results into a
//! [`MatrixReport`].
//!
//! # Example
//!
//! ```no_run
//! use kodegen_bundler_matrix::matrix::{DockerBinfmtRegistrar, MatrixOrchestrator, RunConfig};
//! use std::sync::Arc;
//!
//! # async fn example(config: RunConfig) -> kodegen_bundler_matrix::Result<()> {
//! let orchestrator = MatrixOrchestrator::new(config, Arc::new(DockerBinfmtRegistrar));
//! let report = orchestrator.run().await?;
//! for (id, leg) in &report.legs {
//!     println!("{}: {} ({} artifacts)", id, leg.status, leg.artifacts.len());
//! }
//! # Ok(())
//! # }
//! ```

mod archive;
mod checksum;
mod collect;
mod container;
mod dispatch;
mod emulation;
mod error;
mod leg;
mod orchestrator;
mod platform;
mod provision;
mod report;

pub use collect::{ArtifactCollector, CHECKSUM_MANIFEST, Collected, DEFAULT_PATTERNS};
pub use container::{CONTAINER_WORKSPACE, ContainerInvocation};
pub use dispatch::{ArgumentString, BuildCommand, CommandDispatcher, DEFAULT_ARGS_ENV, PLATFORM_ENV};
pub use emulation::{
    BINFMT_IMAGE, DockerBinfmtRegistrar, EmulationPolicy, EmulationRegistrar, NoopRegistrar,
    needs_emulation,
};
pub use error::{IoContext, LegError, Result};
pub use leg::{Artifact, ArtifactSet, CapturedOutput, LegResult, LegStatus, PlatformLeg};
pub use orchestrator::{MatrixOrchestrator, RunConfig};
pub use platform::{Arch, Os, Platform, Runner, validate_id};
pub use provision::{EnvironmentProvisioner, SourceSettings};
pub use report::MatrixReport;
