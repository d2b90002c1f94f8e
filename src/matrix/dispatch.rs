//! Build command execution for one leg.

use super::container::{container_name, ContainerGuard, ContainerInvocation};
use super::error::LegError;
use super::leg::CapturedOutput;
use super::platform::{Platform, Runner};
use crate::utils::duration::humanize_duration;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;

/// Default environment variable carrying the argument string
pub const DEFAULT_ARGS_ENV: &str = "BUILD_ARGS";

/// Environment variable naming the leg's platform identifier
pub const PLATFORM_ENV: &str = "MATRIX_PLATFORM";

/// Grace period for a killed build command to be reaped
const KILL_GRACE: Duration = Duration::from_secs(10);

/// How long output readers may run on after the build process has exited
const OUTPUT_GRACE: Duration = Duration::from_secs(2);

/// Opaque argument bundle forwarded verbatim to the build command.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArgumentString(String);

impl ArgumentString {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArgumentString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Program plus fixed arguments that every leg runs.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct BuildCommand {
    pub program: String,
    pub argv: Vec<String>,
}

impl BuildCommand {
    /// Splits `[program, args...]`; returns `None` for an empty list or program.
    pub fn from_parts(parts: &[String]) -> Option<Self> {
        let (program, argv) = parts.split_first()?;
        if program.trim().is_empty() {
            return None;
        }
        Some(Self {
            program: program.clone(),
            argv: argv.to_vec(),
        })
    }

    /// Resolves the program for a native leg.
    ///
    /// Bare names are looked up on `PATH`; names containing a separator are taken relative
    /// to the working tree.
    pub fn resolve_program(&self, work_dir: &Path) -> Result<PathBuf, LegError> {
        let program = Path::new(&self.program);
        if program.components().count() > 1 {
            let candidate = if program.is_absolute() {
                program.to_path_buf()
            } else {
                work_dir.join(program)
            };
            return if candidate.is_file() {
                Ok(candidate)
            } else {
                Err(LegError::prerequisite(format!(
                    "build program not found: {}",
                    candidate.display()
                )))
            };
        }
        which::which(&self.program).map_err(|e| {
            LegError::prerequisite(format!(
                "build program '{}' not found on PATH: {}",
                self.program, e
            ))
        })
    }
}

impl fmt::Display for BuildCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.argv {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Runs the build command for one leg and captures its output.
#[derive(Debug)]
pub struct CommandDispatcher<'a> {
    run_id: &'a str,
    command: &'a BuildCommand,
    args: &'a ArgumentString,
    args_env: &'a str,
    timeout: Option<Duration>,
}

impl<'a> CommandDispatcher<'a> {
    pub fn new(
        run_id: &'a str,
        command: &'a BuildCommand,
        args: &'a ArgumentString,
        args_env: &'a str,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            run_id,
            command,
            args,
            args_env,
            timeout,
        }
    }

    /// Environment exported to the build: the argument bundle and the platform id.
    pub fn environment(&self, platform: &Platform) -> Vec<(String, String)> {
        vec![
            (self.args_env.to_string(), self.args.as_str().to_string()),
            (PLATFORM_ENV.to_string(), platform.id.clone()),
        ]
    }

    /// Runs the build once in `work_dir`.
    ///
    /// The captured output is returned in every case so a failed leg keeps its
    /// diagnostics; the error is `Some` for spawn failures, non-zero exits and timeouts.
    /// Completion is decided by the build process exiting, not by its pipes closing.
    pub async fn run(
        &self,
        platform: &Platform,
        work_dir: &Path,
    ) -> (CapturedOutput, Option<LegError>) {
        let (mut command, mut guard) = match self.prepare(platform, work_dir) {
            Ok(prepared) => prepared,
            Err(e) => return (CapturedOutput::default(), Some(e)),
        };

        log::info!("[{}] Running build: {}", platform.id, self.command);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                if let Some(guard) = guard.as_mut() {
                    guard.disarm();
                }
                return (
                    CapturedOutput::default(),
                    Some(LegError::BuildCommand {
                        exit_code: None,
                        reason: format!("failed to spawn '{}': {}", self.command.program, e),
                    }),
                );
            }
        };

        let stdout = OutputDrain::spawn(child.stdout.take(), &platform.id, "stdout");
        let stderr = OutputDrain::spawn(child.stderr.take(), &platform.id, "stderr");

        let status = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait()).await.ok(),
            None => Some(child.wait().await),
        };

        let Some(status) = status else {
            let limit = self.timeout.unwrap_or_default();
            log::warn!(
                "[{}] Build timed out after {}, terminating...",
                platform.id,
                humanize_duration(limit)
            );
            if let Err(e) = child.kill().await {
                log::warn!("[{}] Failed to kill build process: {}", platform.id, e);
            }
            let _ = tokio::time::timeout(KILL_GRACE, child.wait()).await;
            if let Some(guard) = guard {
                guard.remove().await;
            }
            let output = CapturedOutput {
                exit_code: None,
                stdout: stdout.finish().await,
                stderr: stderr.finish().await,
            };
            return (output, Some(LegError::Timeout { limit }));
        };

        match (guard, &status) {
            (Some(mut guard), Ok(_)) => guard.disarm(),
            (Some(guard), Err(_)) => guard.remove().await,
            (None, _) => {}
        }

        let mut output = CapturedOutput {
            exit_code: None,
            stdout: stdout.finish().await,
            stderr: stderr.finish().await,
        };

        match status {
            Ok(status) if status.success() => {
                output.exit_code = status.code();
                (output, None)
            }
            Ok(status) => {
                output.exit_code = status.code();
                let error = LegError::BuildCommand {
                    exit_code: status.code(),
                    reason: format!("'{}' exited with {}", self.command, status),
                };
                (output, Some(error))
            }
            Err(e) => (
                output,
                Some(LegError::BuildCommand {
                    exit_code: None,
                    reason: format!("failed to wait for '{}': {}", self.command.program, e),
                }),
            ),
        }
    }

    fn prepare(
        &self,
        platform: &Platform,
        work_dir: &Path,
    ) -> Result<(Command, Option<ContainerGuard>), LegError> {
        let env = self.environment(platform);

        let (mut command, guard) = match &platform.runner {
            Runner::Native => {
                let program = self.command.resolve_program(work_dir)?;
                let mut command = Command::new(program);
                command.args(&self.command.argv).current_dir(work_dir);
                command.envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
                (command, None)
            }
            Runner::Container { image } => {
                let docker = which::which("docker").map_err(|e| {
                    LegError::prerequisite(format!("docker is required for container legs: {}", e))
                })?;
                let name = container_name(self.run_id, platform);
                let invocation = ContainerInvocation {
                    name: &name,
                    image,
                    platform,
                    work_dir,
                    env: &env,
                    program: &self.command.program,
                    argv: &self.command.argv,
                };
                let mut command = Command::new(docker);
                command.args(invocation.docker_args()).current_dir(work_dir);
                (command, Some(ContainerGuard::new(name)))
            }
        };

        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok((command, guard))
    }
}

/// Background reader for one output stream of the build process.
///
/// Reads raw bytes until EOF so the child never blocks on a full pipe or dies of SIGPIPE,
/// whatever encoding it writes.
struct OutputDrain {
    captured: Arc<Mutex<Vec<u8>>>,
    task: Option<JoinHandle<()>>,
}

impl OutputDrain {
    fn spawn<R>(stream: Option<R>, id: &str, label: &'static str) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let captured = Arc::new(Mutex::new(Vec::new()));
        let task = stream.map(|stream| {
            let sink = Arc::clone(&captured);
            let id = id.to_string();
            tokio::spawn(async move {
                let mut reader = BufReader::new(stream);
                let mut line = Vec::new();
                loop {
                    line.clear();
                    match reader.read_until(b'\n', &mut line).await {
                        Ok(0) => break,
                        Ok(_) => {
                            log::debug!(
                                "[{}:{}] {}",
                                id,
                                label,
                                String::from_utf8_lossy(&line).trim_end()
                            );
                            sink.lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .extend_from_slice(&line);
                        }
                        Err(e) => {
                            log::debug!("[{}:{}] read error: {}", id, label, e);
                            break;
                        }
                    }
                }
            })
        });
        Self { captured, task }
    }

    /// Waits briefly for EOF, then returns what was read.
    ///
    /// Descendants of the build may still hold the pipe open after it exits; their output
    /// is abandoned once the grace period passes.
    async fn finish(self) -> String {
        if let Some(mut task) = self.task {
            if tokio::time::timeout(OUTPUT_GRACE, &mut task).await.is_err() {
                log::debug!("Output stream still open after build exit, detaching");
                task.abort();
            }
        }
        let mut captured = self
            .captured
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&std::mem::take(&mut *captured)).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_command_requires_a_program() {
        assert!(BuildCommand::from_parts(&[]).is_none());
        assert!(BuildCommand::from_parts(&[" ".to_string()]).is_none());

        let command =
            BuildCommand::from_parts(&["python3".to_string(), "scripts/build.py".to_string()])
                .unwrap();
        assert_eq!(command.program, "python3");
        assert_eq!(command.argv, vec!["scripts/build.py"]);
        assert_eq!(command.to_string(), "python3 scripts/build.py");
    }

    #[test]
    fn environment_carries_args_verbatim() {
        let command = BuildCommand::from_parts(&["true".to_string()]).unwrap();
        let args = ArgumentString::new("  --flag 'quoted value'  ");
        let dispatcher = CommandDispatcher::new("run", &command, &args, "PIPCL_ARGS", None);
        let env = dispatcher.environment(&Platform::from_id("ubuntu-latest"));
        assert_eq!(
            env,
            vec![
                ("PIPCL_ARGS".to_string(), "  --flag 'quoted value'  ".to_string()),
                (PLATFORM_ENV.to_string(), "ubuntu-latest".to_string()),
            ]
        );
    }

    #[test]
    fn missing_relative_program_is_a_prerequisite_error() {
        let dir = tempfile::tempdir().unwrap();
        let command = BuildCommand::from_parts(&["scripts/build.sh".to_string()]).unwrap();
        let err = command.resolve_program(dir.path()).unwrap_err();
        assert_eq!(err.kind(), "prerequisite");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_keeps_captured_output() {
        let dir = tempfile::tempdir().unwrap();
        let command = BuildCommand::from_parts(&[
            "sh".to_string(),
            "-c".to_string(),
            "echo \"args=$BUILD_ARGS\"; echo oops >&2; exit 3".to_string(),
        ])
        .unwrap();
        let args = ArgumentString::new("--abi3 x");
        let dispatcher = CommandDispatcher::new("run", &command, &args, DEFAULT_ARGS_ENV, None);

        let (output, error) = dispatcher
            .run(&Platform::from_id("leg"), dir.path())
            .await;

        assert_eq!(output.exit_code, Some(3));
        assert_eq!(output.stdout, "args=--abi3 x\n");
        assert_eq!(output.stderr, "oops\n");
        assert!(matches!(
            error,
            Some(LegError::BuildCommand {
                exit_code: Some(3),
                ..
            })
        ));
    }

    fn shell(script: &str) -> BuildCommand {
        BuildCommand::from_parts(&["sh".to_string(), "-c".to_string(), script.to_string()])
            .unwrap()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_keeps_partial_output() {
        let dir = tempfile::tempdir().unwrap();
        let command = shell("echo started-compiling; echo diag >&2; sleep 30");
        let args = ArgumentString::default();
        let dispatcher = CommandDispatcher::new(
            "run",
            &command,
            &args,
            DEFAULT_ARGS_ENV,
            Some(Duration::from_millis(500)),
        );

        let started = std::time::Instant::now();
        let (output, error) = dispatcher
            .run(&Platform::from_id("leg"), dir.path())
            .await;

        let error = error.unwrap();
        assert_eq!(error.kind(), "timeout");
        assert!(error.to_string().contains("500ms"), "{}", error);
        assert_eq!(output.stdout, "started-compiling\n");
        assert_eq!(output.stderr, "diag\n");
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_utf8_output_does_not_stop_the_drain() {
        let dir = tempfile::tempdir().unwrap();
        let command = shell(
            "printf 'bad \\377\\376 bytes\\n'; \
             i=0; while [ $i -lt 20000 ]; do echo line-$i; i=$((i+1)); done; \
             echo done >&2",
        );
        let args = ArgumentString::default();
        let dispatcher = CommandDispatcher::new("run", &command, &args, DEFAULT_ARGS_ENV, None);

        let (output, error) = dispatcher
            .run(&Platform::from_id("leg"), dir.path())
            .await;

        assert!(error.is_none(), "{:?}", error);
        assert_eq!(output.exit_code, Some(0));
        assert!(output.stdout.starts_with("bad \u{FFFD}\u{FFFD} bytes\n"));
        assert!(output.stdout.ends_with("line-19999\n"));
        assert_eq!(output.stderr, "done\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exit_is_not_held_by_background_children() {
        let dir = tempfile::tempdir().unwrap();
        let command = shell("sleep 20 & echo built; exit 0");
        let args = ArgumentString::default();
        let dispatcher = CommandDispatcher::new("run", &command, &args, DEFAULT_ARGS_ENV, None);

        let started = std::time::Instant::now();
        let (output, error) = dispatcher
            .run(&Platform::from_id("leg"), dir.path())
            .await;

        assert!(error.is_none(), "{:?}", error);
        assert_eq!(output.exit_code, Some(0));
        assert_eq!(output.stdout, "built\n");
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
