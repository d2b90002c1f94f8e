//! Matrix configuration from `matrix.toml` and command line overrides.
//!
//! The file is parsed once into [`MatrixConfig`], merged with [`Overrides`] from the CLI
//! (CLI wins), validated, and frozen into a [`RunConfig`] that the orchestrator shares
//! read-only across legs.

use crate::error::{CliError, MatrixError, Result};
use crate::matrix::{
    Arch, ArgumentString, BuildCommand, DEFAULT_ARGS_ENV, DEFAULT_PATTERNS, EmulationPolicy, Os,
    Platform, RunConfig, SourceSettings, validate_id,
};
use crate::source::RepositorySource;
use path_absolutize::Absolutize;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

/// Default staging root, relative to the invocation directory
pub const DEFAULT_OUTPUT_DIR: &str = "artifacts";

/// Directory name under the user cache dir holding leg working trees
pub const WORK_ROOT_NAME: &str = "kodegen-bundler-matrix";

/// Parsed `matrix.toml`.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MatrixConfig {
    #[serde(default)]
    pub build: BuildTable,
    #[serde(default)]
    pub source: SourceTable,
    #[serde(default)]
    pub artifacts: ArtifactsTable,
    #[serde(default)]
    pub emulation: EmulationTable,
    #[serde(default)]
    pub run: RunTable,
    #[serde(default, rename = "platform")]
    pub platforms: Vec<PlatformEntry>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildTable {
    pub command: Option<Vec<String>>,
    pub args: Option<String>,
    pub args_env: Option<String>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceTable {
    pub path: Option<PathBuf>,
    pub url: Option<String>,
    #[serde(rename = "ref")]
    pub git_ref: Option<String>,
    pub recursive: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArtifactsTable {
    pub patterns: Option<Vec<String>>,
    pub output_dir: Option<PathBuf>,
    pub archive: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EmulationTable {
    pub enabled: Option<bool>,
    pub os: Option<String>,
    pub arch: Option<String>,
    pub image: Option<String>,
    pub targets: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunTable {
    pub work_dir: Option<PathBuf>,
    pub max_parallel: Option<usize>,
    pub keep_workdirs: Option<bool>,
}

/// One `[[platform]]` entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlatformEntry {
    pub id: String,
    pub os: Option<String>,
    pub arch: Option<String>,
    /// Run the leg inside this container image
    pub container: Option<String>,
}

/// Values supplied on the command line; `None`/empty means "not given".
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub platforms: Vec<String>,
    pub args: Option<String>,
    pub args_env: Option<String>,
    pub command: Vec<String>,
    pub source: Option<String>,
    pub git_ref: Option<String>,
    pub recursive: bool,
    pub output_dir: Option<PathBuf>,
    pub work_dir: Option<PathBuf>,
    pub patterns: Vec<String>,
    pub timeout_secs: Option<u64>,
    pub max_parallel: Option<usize>,
    pub no_emulation: bool,
    pub archive: bool,
    pub keep_workdirs: bool,
}

/// Load and parse a matrix file.
pub fn load_config(path: &Path) -> Result<MatrixConfig> {
    let contents = std::fs::read_to_string(path).map_err(|e| MatrixError::Config {
        path: Some(path.to_path_buf()),
        reason: format!("failed to read: {}", e),
    })?;
    parse_config(&contents).map_err(|e| match e {
        MatrixError::Config { reason, .. } => MatrixError::Config {
            path: Some(path.to_path_buf()),
            reason,
        },
        MatrixError::Toml(e) => MatrixError::Config {
            path: Some(path.to_path_buf()),
            reason: e.to_string(),
        },
        other => other,
    })
}

/// Parse matrix TOML from a string.
pub fn parse_config(contents: &str) -> Result<MatrixConfig> {
    Ok(toml::from_str(contents)?)
}

impl MatrixConfig {
    /// Merges CLI overrides and resolves everything into an immutable [`RunConfig`].
    ///
    /// * `config_dir` - directory relative paths in the file are resolved against
    /// * `cwd` - directory relative CLI paths are resolved against
    pub fn into_run_config(self, overrides: Overrides, config_dir: &Path, cwd: &Path) -> Result<RunConfig> {
        let platforms = self.resolve_platforms(&overrides.platforms)?;

        let command_parts = if overrides.command.is_empty() {
            self.build.command.clone().unwrap_or_default()
        } else {
            overrides.command.clone()
        };
        let command = BuildCommand::from_parts(&command_parts).ok_or_else(|| {
            MatrixError::Cli(CliError::MissingArgument {
                argument: "build command (`-- <command>...` or [build].command)".to_string(),
            })
        })?;

        let args_env = overrides
            .args_env
            .clone()
            .or(self.build.args_env)
            .unwrap_or_else(|| DEFAULT_ARGS_ENV.to_string());
        if args_env.is_empty() || args_env.contains('=') || args_env.contains('\0') {
            return Err(MatrixError::config(format!(
                "invalid argument environment variable name '{}'",
                args_env
            )));
        }

        let args = ArgumentString::new(overrides.args.clone().or(self.build.args).unwrap_or_default());

        let source = resolve_source(&self.source, &overrides, config_dir, cwd)?;

        let patterns = if overrides.patterns.is_empty() {
            self.artifacts
                .patterns
                .clone()
                .unwrap_or_else(|| DEFAULT_PATTERNS.iter().map(|p| p.to_string()).collect())
        } else {
            overrides.patterns.clone()
        };
        validate_patterns(&patterns)?;

        let output_dir = match (&overrides.output_dir, &self.artifacts.output_dir) {
            (Some(dir), _) => absolutize(dir, cwd)?,
            (None, Some(dir)) => absolutize(dir, config_dir)?,
            (None, None) => absolutize(Path::new(DEFAULT_OUTPUT_DIR), cwd)?,
        };

        let work_root = match (&overrides.work_dir, &self.run.work_dir) {
            (Some(dir), _) => absolutize(dir, cwd)?,
            (None, Some(dir)) => absolutize(dir, config_dir)?,
            (None, None) => default_work_root(),
        };

        let emulation = resolve_emulation(&self.emulation, overrides.no_emulation)?;

        let timeout = overrides
            .timeout_secs
            .or(self.build.timeout_secs)
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        let max_parallel = overrides.max_parallel.or(self.run.max_parallel);
        if max_parallel == Some(0) {
            return Err(MatrixError::config("max_parallel must be at least 1"));
        }

        Ok(RunConfig {
            platforms,
            args,
            args_env,
            command,
            source,
            patterns,
            output_dir,
            archive: overrides.archive || self.artifacts.archive.unwrap_or(false),
            emulation,
            timeout,
            work_root,
            max_parallel,
            keep_workdirs: overrides.keep_workdirs || self.run.keep_workdirs.unwrap_or(false),
        })
    }

    /// Matrix entries, narrowed to `selected` ids when any are given on the CLI.
    fn resolve_platforms(&self, selected: &[String]) -> Result<Vec<Platform>> {
        let entries: Vec<PlatformEntry> = if selected.is_empty() {
            self.platforms.clone()
        } else {
            selected
                .iter()
                .map(|id| {
                    self.platforms
                        .iter()
                        .find(|entry| &entry.id == id)
                        .cloned()
                        .unwrap_or_else(|| PlatformEntry {
                            id: id.clone(),
                            os: None,
                            arch: None,
                            container: None,
                        })
                })
                .collect()
        };

        if entries.is_empty() {
            return Err(MatrixError::Cli(CliError::MissingArgument {
                argument: "platform (`--platform <ID>` or [[platform]] entries)".to_string(),
            }));
        }

        let mut seen = HashSet::new();
        let mut platforms = Vec::with_capacity(entries.len());
        for entry in entries {
            validate_id(&entry.id).map_err(MatrixError::config)?;
            if !seen.insert(entry.id.clone()) {
                return Err(MatrixError::config(format!(
                    "platform '{}' appears more than once in the matrix",
                    entry.id
                )));
            }
            platforms.push(entry.into_platform()?);
        }
        Ok(platforms)
    }
}

impl PlatformEntry {
    fn into_platform(self) -> Result<Platform> {
        let mut platform = Platform::from_id(self.id);
        if let Some(os) = &self.os {
            platform = platform.with_os(
                Os::parse(os).ok_or_else(|| MatrixError::config(format!("unknown os '{}'", os)))?,
            );
        }
        if let Some(arch) = &self.arch {
            platform = platform.with_arch(
                Arch::parse(arch)
                    .ok_or_else(|| MatrixError::config(format!("unknown arch '{}'", arch)))?,
            );
        }
        if let Some(image) = self.container.filter(|i| !i.trim().is_empty()) {
            // Containers are Linux unless the entry says otherwise
            if self.os.is_none() {
                platform = platform.with_os(Os::Linux);
            }
            platform = platform.with_container(image);
        }
        Ok(platform)
    }
}

fn resolve_source(
    table: &SourceTable,
    overrides: &Overrides,
    config_dir: &Path,
    cwd: &Path,
) -> Result<SourceSettings> {
    let repository = match (&overrides.source, &table.path, &table.url) {
        (Some(source), _, _) => match RepositorySource::parse(source).map_err(MatrixError::config)? {
            RepositorySource::Local(path) => RepositorySource::Local(absolutize(&path, cwd)?),
            remote => remote,
        },
        (None, Some(_), Some(_)) => {
            return Err(MatrixError::config(
                "[source] sets both `path` and `url`; choose one",
            ));
        }
        (None, Some(path), None) => RepositorySource::Local(absolutize(path, config_dir)?),
        (None, None, Some(url)) => match RepositorySource::parse(url).map_err(MatrixError::config)? {
            RepositorySource::Local(_) => {
                return Err(MatrixError::config(format!(
                    "[source] url '{}' is not a git URL or org/repo",
                    url
                )));
            }
            remote => remote,
        },
        (None, None, None) => RepositorySource::Local(absolutize(config_dir, cwd)?),
    };

    Ok(SourceSettings {
        repository,
        git_ref: overrides.git_ref.clone().or_else(|| table.git_ref.clone()),
        recursive: overrides.recursive || table.recursive.unwrap_or(false),
    })
}

fn resolve_emulation(table: &EmulationTable, disabled: bool) -> Result<EmulationPolicy> {
    let mut policy = EmulationPolicy::default();
    if let Some(enabled) = table.enabled {
        policy.enabled = enabled;
    }
    if disabled {
        policy.enabled = false;
    }
    if let Some(os) = &table.os {
        policy.os = Os::parse(os)
            .ok_or_else(|| MatrixError::config(format!("unknown emulation os '{}'", os)))?;
    }
    if let Some(arch) = &table.arch {
        policy.arch = Arch::parse(arch)
            .ok_or_else(|| MatrixError::config(format!("unknown emulation arch '{}'", arch)))?;
    }
    if let Some(image) = &table.image {
        policy.image = image.clone();
    }
    if let Some(targets) = &table.targets {
        policy.targets = targets.clone();
    }
    Ok(policy)
}

/// Patterns must stay inside the working tree.
fn validate_patterns(patterns: &[String]) -> Result<()> {
    if patterns.is_empty() {
        return Err(MatrixError::config("at least one artifact pattern is required"));
    }
    for pattern in patterns {
        let path = Path::new(pattern);
        if pattern.trim().is_empty()
            || path.is_absolute()
            || path.components().any(|c| matches!(c, Component::ParentDir))
        {
            return Err(MatrixError::config(format!(
                "artifact pattern '{}' must be relative to the working tree",
                pattern
            )));
        }
        glob::Pattern::new(pattern).map_err(|e| {
            MatrixError::config(format!("invalid artifact pattern '{}': {}", pattern, e))
        })?;
    }
    Ok(())
}

fn absolutize(path: &Path, base: &Path) -> Result<PathBuf> {
    Ok(path.absolutize_from(base)?.into_owned())
}

fn default_work_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(WORK_ROOT_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::Runner;

    const SAMPLE: &str = r#"
[build]
command = ["python3", "scripts/build.py"]
args_env = "PIPCL_ARGS"
timeout_secs = 600

[source]
path = "."
recursive = true

[artifacts]
output_dir = "dist"
archive = true

[emulation]
targets = "arm64"

[[platform]]
id = "ubuntu-latest"

[[platform]]
id = "manylinux-aarch64"
arch = "aarch64"
container = "quay.io/pypa/manylinux2014_aarch64"
"#;

    #[test]
    fn resolves_file_with_defaults() {
        let config = parse_config(SAMPLE).unwrap();
        let run = config
            .into_run_config(Overrides::default(), Path::new("/repo"), Path::new("/elsewhere"))
            .unwrap();

        assert_eq!(run.platforms.len(), 2);
        assert_eq!(run.platforms[1].arch, Arch::AArch64);
        assert_eq!(run.platforms[1].os, Os::Linux);
        assert!(matches!(run.platforms[1].runner, Runner::Container { .. }));
        assert_eq!(run.command.program, "python3");
        assert_eq!(run.args_env, "PIPCL_ARGS");
        assert_eq!(run.args.as_str(), "");
        assert_eq!(run.timeout, Some(Duration::from_secs(600)));
        assert_eq!(run.output_dir, PathBuf::from("/repo/dist"));
        assert!(run.archive);
        assert!(run.source.recursive);
        assert!(matches!(&run.source.repository, RepositorySource::Local(p) if p == Path::new("/repo")));
        assert_eq!(run.patterns, vec!["wheelhouse/*.whl", "wheelhouse/*.tar.gz"]);
        assert_eq!(run.emulation.targets, "arm64");
        assert!(run.emulation.enabled);
    }

    #[test]
    fn cli_overrides_win() {
        let config = parse_config(SAMPLE).unwrap();
        let overrides = Overrides {
            platforms: vec!["manylinux-aarch64".to_string(), "macos-14-arm64".to_string()],
            args: Some("--sdist 1".to_string()),
            command: vec!["make".to_string(), "wheels".to_string()],
            output_dir: Some(PathBuf::from("out")),
            no_emulation: true,
            timeout_secs: Some(0),
            ..Default::default()
        };
        let run = config
            .into_run_config(overrides, Path::new("/repo"), Path::new("/cwd"))
            .unwrap();

        let ids: Vec<_> = run.platforms.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["manylinux-aarch64", "macos-14-arm64"]);
        // Selected ids keep their file settings
        assert!(matches!(run.platforms[0].runner, Runner::Container { .. }));
        assert_eq!(run.platforms[1].os, Os::Macos);
        assert_eq!(run.command.to_string(), "make wheels");
        assert_eq!(run.args.as_str(), "--sdist 1");
        assert_eq!(run.output_dir, PathBuf::from("/cwd/out"));
        assert!(!run.emulation.enabled);
        assert_eq!(run.timeout, None);
    }

    #[test]
    fn rejects_duplicate_platforms() {
        let config = parse_config(
            r#"
[build]
command = ["true"]
[[platform]]
id = "ubuntu-latest"
[[platform]]
id = "ubuntu-latest"
"#,
        )
        .unwrap();
        let err = config
            .into_run_config(Overrides::default(), Path::new("/"), Path::new("/"))
            .unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn requires_platforms_and_command() {
        let err = MatrixConfig::default()
            .into_run_config(Overrides::default(), Path::new("/"), Path::new("/"))
            .unwrap_err();
        assert!(matches!(err, MatrixError::Cli(CliError::MissingArgument { .. })));

        let overrides = Overrides {
            platforms: vec!["ubuntu-latest".to_string()],
            ..Default::default()
        };
        let err = MatrixConfig::default()
            .into_run_config(overrides, Path::new("/"), Path::new("/"))
            .unwrap_err();
        assert!(err.to_string().contains("build command"));
    }

    #[test]
    fn rejects_escaping_patterns_and_bad_ids() {
        let overrides = Overrides {
            platforms: vec!["ubuntu-latest".to_string()],
            command: vec!["true".to_string()],
            patterns: vec!["../outside/*.whl".to_string()],
            ..Default::default()
        };
        assert!(MatrixConfig::default()
            .into_run_config(overrides.clone(), Path::new("/"), Path::new("/"))
            .is_err());

        let bad_id = Overrides {
            platforms: vec!["../etc".to_string()],
            patterns: vec![],
            ..overrides
        };
        assert!(MatrixConfig::default()
            .into_run_config(bad_id, Path::new("/"), Path::new("/"))
            .is_err());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(matches!(
            parse_config("[build]\ncomand = [\"x\"]\n"),
            Err(MatrixError::Toml(_))
        ));
    }

    #[test]
    fn source_path_and_url_conflict() {
        let config = parse_config(
            r#"
[build]
command = ["true"]
[source]
path = "."
url = "https://github.com/org/repo.git"
[[platform]]
id = "ubuntu-latest"
"#,
        )
        .unwrap();
        assert!(config
            .into_run_config(Overrides::default(), Path::new("/"), Path::new("/"))
            .is_err());
    }
}
