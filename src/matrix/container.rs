//! `docker run` argument construction and cleanup for container legs.

use super::platform::Platform;
use std::path::Path;
use std::process::Stdio;

/// Mount point of the leg's working tree inside the container
pub const CONTAINER_WORKSPACE: &str = "/workspace";

/// Container name for one leg of one run; unique across concurrent runs.
pub fn container_name(run_id: &str, platform: &Platform) -> String {
    format!("matrix-{}-{}", run_id, platform.id)
}

/// Builds the `docker run` invocation for one container leg.
pub struct ContainerInvocation<'a> {
    /// Value for `--name`, so the container can be removed if the client is killed
    pub name: &'a str,
    pub image: &'a str,
    pub platform: &'a Platform,
    pub work_dir: &'a Path,
    pub env: &'a [(String, String)],
    pub program: &'a str,
    pub argv: &'a [String],
}

impl ContainerInvocation<'_> {
    /// Builds Docker command arguments for the leg.
    ///
    /// # Returns
    ///
    /// Vector of command arguments for `docker`
    pub fn docker_args(&self) -> Vec<String> {
        let workspace_mount = format!("{}:{}:rw", self.work_dir.display(), CONTAINER_WORKSPACE);

        let mut docker_args = vec![
            "run".to_string(),
            "--name".to_string(),
            self.name.to_string(),
            "--rm".to_string(),
            // SECURITY: Prevent privilege escalation in container
            "--security-opt".to_string(),
            "no-new-privileges".to_string(),
            "--platform".to_string(),
            format!("linux/{}", self.platform.arch.docker_name()),
            "-v".to_string(),
            workspace_mount,
            "-w".to_string(),
            CONTAINER_WORKSPACE.to_string(),
        ];

        // Staged artifacts must be owned by the invoking user
        #[cfg(unix)]
        {
            let uid = users::get_current_uid();
            let gid = users::get_current_gid();
            docker_args.push("--user".to_string());
            docker_args.push(format!("{}:{}", uid, gid));
        }

        for (key, value) in self.env {
            docker_args.push("-e".to_string());
            docker_args.push(format!("{}={}", key, value));
        }

        docker_args.push(self.image.to_string());
        docker_args.push(self.program.to_string());
        docker_args.extend(self.argv.iter().cloned());

        docker_args
    }
}

/// Force-removes a named container on drop unless disarmed.
///
/// Killing the `docker` client does not stop the container it started; the guard makes
/// sure a timed-out or abandoned leg never leaves one writing into its working tree.
#[derive(Debug)]
pub struct ContainerGuard {
    name: String,
    armed: bool,
}

impl ContainerGuard {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            armed: true,
        }
    }

    /// The container exited on its own and `--rm` removed it.
    pub fn disarm(&mut self) {
        self.armed = false;
    }

    pub fn remove_args(&self) -> [&str; 3] {
        ["rm", "-f", self.name.as_str()]
    }

    /// Removes the container now, waiting for docker to finish.
    pub async fn remove(mut self) {
        self.armed = false;
        let result = tokio::process::Command::new("docker")
            .args(self.remove_args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        match result {
            Ok(status) if status.success() => log::debug!("Removed container {}", self.name),
            Ok(status) => log::debug!("docker rm -f {} exited with {}", self.name, status),
            Err(e) => log::warn!("Failed to remove container {}: {}", self.name, e),
        }
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let result = std::process::Command::new("docker")
            .args(self.remove_args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        if let Err(e) = result {
            log::warn!("Failed to remove container {}: {}", self.name, e);
        }
    }
}
