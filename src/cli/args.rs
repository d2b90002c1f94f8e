//! Command line argument parsing and validation.

use crate::config::Overrides;
use clap::Parser;
use std::path::PathBuf;

/// Cross-platform build matrix dispatcher
#[derive(Parser, Debug)]
#[command(
    name = "kodegen_bundler_matrix",
    version,
    about = "Runs one build per platform and collects the packaged artifacts",
    long_about = "Runs the same build command once per platform in the matrix, each leg in its own
clean working tree, and stages matching artifacts under <output-dir>/<platform-id>/.

The argument string is handed to every build unchanged through an environment variable
(BUILD_ARGS by default); it is never split or interpreted.

Usage:
  kodegen_bundler_matrix --config matrix.toml --args \"--sdist 1\"
  kodegen_bundler_matrix --platform ubuntu-latest --platform macos-14 -- python3 build.py
  kodegen_bundler_matrix --source org/repo --ref v1.2.0 --recursive -- ./scripts/wheels.sh

Exit code 0 = every leg succeeded, 1 = at least one leg failed, 2 = invalid configuration."
)]
pub struct Args {
    /// Matrix file (TOML)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Platform identifier to build; repeat for several. Narrows the matrix file when given.
    #[arg(short, long = "platform", value_name = "ID")]
    pub platforms: Vec<String>,

    /// Argument string passed verbatim to every build
    #[arg(
        short,
        long,
        value_name = "STRING",
        env = "MATRIX_ARGS",
        default_value = "",
        allow_hyphen_values = true
    )]
    pub args: String,

    /// Environment variable that carries the argument string
    #[arg(long, value_name = "NAME")]
    pub args_env: Option<String>,

    /// Source repository (local path, GitHub org/repo, or git URL)
    #[arg(short, long, value_name = "SOURCE")]
    pub source: Option<String>,

    /// Branch, tag or commit to check out for remote sources
    #[arg(long = "ref", value_name = "REF")]
    pub git_ref: Option<String>,

    /// Also fetch nested submodules
    #[arg(long)]
    pub recursive: bool,

    /// Root directory for staged artifacts
    #[arg(short, long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Root directory for per-leg working trees
    #[arg(long, value_name = "DIR")]
    pub work_dir: Option<PathBuf>,

    /// Artifact glob relative to the working tree; repeat for several
    #[arg(long = "pattern", value_name = "GLOB")]
    pub patterns: Vec<String>,

    /// Per-leg build timeout in seconds (0 disables)
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Maximum number of legs running at once
    #[arg(short = 'j', long, value_name = "N")]
    pub max_parallel: Option<usize>,

    /// Never register foreign-architecture emulation
    #[arg(long)]
    pub no_emulation: bool,

    /// Also bundle each leg's artifacts into <output-dir>/<platform-id>.tar.gz
    #[arg(long)]
    pub archive: bool,

    /// Keep working trees of successful legs
    #[arg(long)]
    pub keep_workdirs: bool,

    /// Write a JSON run report to this path
    #[arg(long, value_name = "FILE")]
    pub report: Option<PathBuf>,

    /// Echo captured output of failed legs
    #[arg(short, long, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only print errors and the final summary
    #[arg(short, long)]
    pub quiet: bool,

    /// Build command and its arguments
    #[arg(last = true, value_name = "COMMAND")]
    pub command: Vec<String>,
}

impl Args {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate arguments for consistency
    pub fn validate(&self) -> Result<(), String> {
        if self.config.is_none() && self.platforms.is_empty() {
            return Err("No platforms: pass --platform <ID> or --config <FILE>".to_string());
        }
        if self.config.is_none() && self.command.is_empty() {
            return Err("No build command: pass it after `--` or use --config <FILE>".to_string());
        }
        if let Some(source) = &self.source
            && source.trim().is_empty()
        {
            return Err("Source cannot be empty".to_string());
        }
        if self.max_parallel == Some(0) {
            return Err("--max-parallel must be at least 1".to_string());
        }
        Ok(())
    }

    /// Values that take precedence over the matrix file.
    pub fn overrides(&self) -> Overrides {
        Overrides {
            platforms: self.platforms.clone(),
            // An empty string means "not given" so the file can supply one
            args: Some(self.args.clone()).filter(|a| !a.is_empty()),
            args_env: self.args_env.clone(),
            command: self.command.clone(),
            source: self.source.clone(),
            git_ref: self.git_ref.clone(),
            recursive: self.recursive,
            output_dir: self.output_dir.clone(),
            work_dir: self.work_dir.clone(),
            patterns: self.patterns.clone(),
            timeout_secs: self.timeout,
            max_parallel: self.max_parallel,
            no_emulation: self.no_emulation,
            archive: self.archive,
            keep_workdirs: self.keep_workdirs,
        }
    }
}

/// Configuration derived from command line arguments
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Output manager for colored terminal output
    output: super::OutputManager,
}

impl From<&Args> for RuntimeConfig {
    fn from(args: &Args) -> Self {
        Self {
            output: super::OutputManager::new(args.verbose, args.quiet),
        }
    }
}

impl RuntimeConfig {
    /// Get a reference to the output manager
    pub fn output(&self) -> &super::OutputManager {
        &self.output
    }

    pub fn is_verbose(&self) -> bool {
        self.output.is_verbose()
    }

    /// Print verbose message if in verbose mode
    pub fn verbose_println(&self, message: &str) -> std::io::Result<()> {
        self.output.verbose(message)
    }

    /// Print success message if not in quiet mode
    pub fn success(&self, message: &str) -> std::io::Result<()> {
        self.output.success(message)
    }

    /// Print warning message if not in quiet mode
    pub fn warn(&self, message: &str) -> std::io::Result<()> {
        self.output.warn(message)
    }

    /// Print error message; never suppressed
    pub fn error(&self, message: &str) -> std::io::Result<()> {
        self.output.error(message)
    }

    /// Print progress message
    pub fn progress(&self, message: &str) -> std::io::Result<()> {
        self.output.progress(message)
    }

    /// Print section header
    pub fn section(&self, title: &str) -> std::io::Result<()> {
        self.output.section(title)
    }

    /// Print indented text
    pub fn indent(&self, message: &str) -> std::io::Result<()> {
        self.output.indent(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_command_and_repeated_platforms() {
        let args = Args::try_parse_from([
            "kodegen_bundler_matrix",
            "-p",
            "ubuntu-latest",
            "--platform",
            "macos-14",
            "--args",
            "--sdist 1 --wheel",
            "--",
            "python3",
            "build.py",
            "--flag",
        ])
        .unwrap();

        assert_eq!(args.platforms, vec!["ubuntu-latest", "macos-14"]);
        assert_eq!(args.args, "--sdist 1 --wheel");
        assert_eq!(args.command, vec!["python3", "build.py", "--flag"]);
        assert!(args.validate().is_ok());
        assert_eq!(args.overrides().args.as_deref(), Some("--sdist 1 --wheel"));
    }

    #[test]
    fn needs_platforms_without_config() {
        let args = Args::try_parse_from(["kodegen_bundler_matrix", "--", "make"]).unwrap();
        assert!(args.validate().is_err());
    }

    #[test]
    fn verbose_and_quiet_conflict() {
        assert!(Args::try_parse_from(["kodegen_bundler_matrix", "-v", "-q"]).is_err());
    }
}
