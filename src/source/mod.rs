//! Source repository resolution and acquisition into a leg's working tree.

use crate::matrix::{IoContext, LegError};
use crate::utils::fs;
use std::path::{Path, PathBuf};
use tokio::process::Command;

/// Where a leg's sources come from.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RepositorySource {
    /// A directory on this machine, copied into each leg.
    Local(PathBuf),
    /// GitHub `org/repo` shorthand.
    GitHub { org: String, repo: String },
    /// Any URL `git clone` understands.
    GitUrl(String),
}

impl RepositorySource {
    /// Classifies a source string.
    ///
    /// Existing paths always win, so a relative `sub/dir` is never mistaken for a
    /// GitHub shorthand.
    pub fn parse(source: &str) -> Result<Self, String> {
        let trimmed = source.trim();
        if trimmed.is_empty() {
            return Err("source cannot be empty".to_string());
        }

        if Path::new(trimmed).exists() {
            return Ok(Self::Local(PathBuf::from(trimmed)));
        }

        if trimmed.contains("://") {
            let parsed = url::Url::parse(trimmed)
                .map_err(|e| format!("invalid source URL '{}': {}", trimmed, e))?;
            return match parsed.scheme() {
                "http" | "https" | "ssh" | "git" | "file" => Ok(Self::GitUrl(trimmed.to_string())),
                other => Err(format!("unsupported source URL scheme '{}'", other)),
            };
        }

        // scp-like remote: git@github.com:org/repo.git
        if trimmed.starts_with("git@") && trimmed.contains(':') {
            return Ok(Self::GitUrl(trimmed.to_string()));
        }

        if !trimmed.starts_with('.') && !trimmed.starts_with('/') {
            let parts: Vec<&str> = trimmed.split('/').collect();
            if parts.len() == 2 && parts.iter().all(|p| !p.is_empty()) {
                return Ok(Self::GitHub {
                    org: parts[0].to_string(),
                    repo: parts[1].trim_end_matches(".git").to_string(),
                });
            }
        }

        // Let acquisition report the missing directory with leg context
        Ok(Self::Local(PathBuf::from(trimmed)))
    }

    /// URL passed to `git clone`, if this is a remote source.
    pub fn clone_url(&self) -> Option<String> {
        match self {
            Self::Local(_) => None,
            Self::GitHub { org, repo } => Some(format!("https://github.com/{}/{}.git", org, repo)),
            Self::GitUrl(url) => Some(url.clone()),
        }
    }

    /// Populates `dest` (which must be empty or absent) with the sources.
    ///
    /// Local trees are copied with `exclude` filtered out; remote sources are shallow-cloned.
    /// With `recursive`, nested submodules are fetched as well.
    pub async fn acquire(
        &self,
        dest: &Path,
        git_ref: Option<&str>,
        recursive: bool,
        exclude: &[PathBuf],
    ) -> crate::matrix::Result<()> {
        match self {
            Self::Local(path) => {
                if !path.is_dir() {
                    return Err(LegError::acquisition(format!(
                        "source directory does not exist: {}",
                        path.display()
                    )));
                }
                fs::copy_dir(path, dest, exclude)
                    .await
                    .acquisition_context("copying source tree into", dest)?;

                if let Some(reference) = git_ref {
                    log::debug!(
                        "Ignoring ref '{}' for local source {}; the tree is copied as-is",
                        reference,
                        path.display()
                    );
                }

                if recursive && dest.join(".gitmodules").is_file() {
                    run_git(
                        dest,
                        &["submodule", "update", "--init", "--recursive"],
                        "git submodule update",
                    )
                    .await?;
                }
                Ok(())
            }
            Self::GitHub { .. } | Self::GitUrl(_) => {
                let url = self.clone_url().unwrap_or_default();
                clone_repo(&url, dest, git_ref, recursive).await
            }
        }
    }
}

async fn clone_repo(url: &str, dest: &Path, git_ref: Option<&str>, recursive: bool) -> crate::matrix::Result<()> {
    let dest_str = dest.to_str().ok_or_else(|| {
        LegError::acquisition(format!(
            "working tree path contains invalid UTF-8: {}",
            dest.display()
        ))
    })?;

    let mut args = vec!["clone", "--depth=1"];
    if let Some(reference) = git_ref {
        args.push("--branch");
        args.push(reference);
    }
    if recursive {
        args.push("--recurse-submodules");
        args.push("--shallow-submodules");
    }
    args.push(url);
    args.push(dest_str);

    let cwd = dest.parent().unwrap_or(dest);
    run_git(cwd, &args, "git clone").await
}

async fn run_git(cwd: &Path, args: &[&str], label: &str) -> crate::matrix::Result<()> {
    let git = which::which("git").map_err(|e| {
        LegError::prerequisite(format!("git is required to fetch sources but was not found: {}", e))
    })?;

    log::debug!("Running {} in {}", label, cwd.display());
    let output = Command::new(git)
        .args(args)
        .current_dir(cwd)
        .output()
        .await
        .acquisition_context("spawning git in", cwd)?;

    if !output.status.success() {
        return Err(LegError::acquisition(format!(
            "{} failed ({}): {}",
            label,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}
