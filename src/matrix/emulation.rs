//! Foreign-architecture emulation gate.
//!
//! Hosted Linux x86_64 legs register QEMU binfmt handlers before building so the wrapped
//! build can run containers for other architectures (aarch64 manylinux images and so on).
//! Whether a leg needs this is a pure function of its platform and the policy; the
//! registration itself sits behind [`EmulationRegistrar`].

use super::error::LegError;
use super::platform::{Arch, Os, Platform};
use async_trait::async_trait;
use serde::Serialize;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Default binfmt installer image
pub const BINFMT_IMAGE: &str = "tonistiigi/binfmt";

/// Timeout for handler registration (5 minutes); the image may need pulling first
pub const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(300);

/// Condition under which a leg registers emulation handlers.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct EmulationPolicy {
    pub enabled: bool,
    pub os: Os,
    pub arch: Arch,
    pub image: String,
    /// Value for `--install` (`all`, or a comma-separated list such as `arm64,ppc64le`)
    pub targets: String,
}

impl Default for EmulationPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            os: Os::Linux,
            arch: Arch::X86_64,
            image: BINFMT_IMAGE.to_string(),
            targets: "all".to_string(),
        }
    }
}

/// Whether `platform` must register emulation handlers before building.
pub fn needs_emulation(platform: &Platform, policy: &EmulationPolicy) -> bool {
    policy.enabled && platform.os == policy.os && platform.arch == policy.arch
}

/// Registers foreign-architecture execution handlers for one leg.
#[async_trait]
pub trait EmulationRegistrar: Send + Sync {
    async fn register(&self, platform: &Platform, policy: &EmulationPolicy) -> Result<(), LegError>;
}

/// Registers handlers with `docker run --privileged --rm <image> --install <targets>`.
#[derive(Debug, Default)]
pub struct DockerBinfmtRegistrar;

impl DockerBinfmtRegistrar {
    pub fn build_args(policy: &EmulationPolicy) -> Vec<String> {
        vec![
            "run".to_string(),
            "--privileged".to_string(),
            "--rm".to_string(),
            policy.image.clone(),
            "--install".to_string(),
            policy.targets.clone(),
        ]
    }
}

#[async_trait]
impl EmulationRegistrar for DockerBinfmtRegistrar {
    async fn register(&self, platform: &Platform, policy: &EmulationPolicy) -> Result<(), LegError> {
        let docker = which::which("docker").map_err(|e| LegError::EmulationSetup {
            reason: format!("docker is required to register binfmt handlers: {}", e),
        })?;

        let args = Self::build_args(policy);
        log::info!(
            "[{}] Registering emulation handlers: docker {}",
            platform.id,
            args.join(" ")
        );

        let output = Command::new(docker)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(REGISTRATION_TIMEOUT, output).await {
            Err(_) => Err(LegError::EmulationSetup {
                reason: format!(
                    "binfmt registration timed out after {} seconds",
                    REGISTRATION_TIMEOUT.as_secs()
                ),
            }),
            Ok(Err(e)) => Err(LegError::EmulationSetup {
                reason: format!("failed to spawn docker: {}", e),
            }),
            Ok(Ok(output)) if output.status.success() => Ok(()),
            Ok(Ok(output)) => Err(LegError::EmulationSetup {
                reason: format!(
                    "docker {} exited with {}: {}",
                    args.join(" "),
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            }),
        }
    }
}

/// Registrar used with `--no-emulation`; accepts every request without doing anything.
#[derive(Debug, Default)]
pub struct NoopRegistrar;

#[async_trait]
impl EmulationRegistrar for NoopRegistrar {
    async fn register(&self, platform: &Platform, _policy: &EmulationPolicy) -> Result<(), LegError> {
        log::debug!("[{}] Emulation registration disabled", platform.id);
        Ok(())
    }
}
