//! Colored terminal output for the CLI.

use crate::matrix::{LegResult, MatrixReport};
use crate::utils::duration::humanize_duration;
use colored::*;
use std::io::{self, Write};
use std::time::Duration;

/// Lines of captured output echoed for a failed leg in verbose mode
const FAILURE_TAIL_LINES: usize = 40;

/// Writes user-facing messages honoring `--verbose` and `--quiet`.
#[derive(Debug, Clone, Copy)]
pub struct OutputManager {
    verbose: bool,
    quiet: bool,
}

impl OutputManager {
    pub fn new(verbose: bool, quiet: bool) -> Self {
        Self { verbose, quiet }
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    pub fn verbose(&self, message: &str) -> io::Result<()> {
        if !self.verbose {
            return Ok(());
        }
        writeln!(io::stdout(), "{}", message.dimmed())
    }

    pub fn progress(&self, message: &str) -> io::Result<()> {
        if self.quiet {
            return Ok(());
        }
        writeln!(io::stdout(), "{} {}", "→".cyan(), message)
    }

    pub fn success(&self, message: &str) -> io::Result<()> {
        if self.quiet {
            return Ok(());
        }
        writeln!(io::stdout(), "{} {}", "✓".green(), message)
    }

    pub fn warn(&self, message: &str) -> io::Result<()> {
        if self.quiet {
            return Ok(());
        }
        writeln!(io::stderr(), "{} {}", "warning:".yellow().bold(), message)
    }

    pub fn error(&self, message: &str) -> io::Result<()> {
        writeln!(io::stderr(), "{} {}", "error:".red().bold(), message)
    }

    pub fn section(&self, title: &str) -> io::Result<()> {
        if self.quiet {
            return Ok(());
        }
        let mut out = io::stdout();
        writeln!(out)?;
        writeln!(out, "{}", title.bold())?;
        writeln!(out, "{}", "─".repeat(title.chars().count()).dimmed())
    }

    pub fn indent(&self, message: &str) -> io::Result<()> {
        if self.quiet {
            return Ok(());
        }
        writeln!(io::stdout(), "  {}", message)
    }

    /// Prints the per-leg summary. Always shown, even with `--quiet`.
    pub fn summary(&self, report: &MatrixReport) -> io::Result<()> {
        let mut out = io::stdout();
        writeln!(out)?;
        writeln!(out, "{}", "Matrix summary".bold())?;

        let width = report.legs.keys().map(|id| id.len()).max().unwrap_or(0);
        for (id, leg) in &report.legs {
            let duration = humanize_duration(Duration::from_millis(leg.duration_ms));
            if leg.succeeded() {
                writeln!(
                    out,
                    "  {} {:<width$}  {} artifact(s)  {}",
                    "✓".green(),
                    id,
                    leg.artifacts.len(),
                    duration.dimmed(),
                    width = width
                )?;
                for name in leg.artifacts.names() {
                    writeln!(out, "      {}", name.dimmed())?;
                }
            } else {
                writeln!(
                    out,
                    "  {} {:<width$}  {} at {}: {}  {}",
                    "✗".red(),
                    id,
                    leg.error_kind.as_deref().unwrap_or("failed").red(),
                    leg.failed_stage
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| "unknown".to_string()),
                    leg.error.as_deref().unwrap_or(""),
                    duration.dimmed(),
                    width = width
                )?;
                if self.verbose {
                    self.failure_output(&mut out, leg)?;
                }
            }
        }

        let failed = report.failed_legs().count();
        let line = format!(
            "{} of {} leg(s) succeeded, {} artifact(s) collected",
            report.legs.len() - failed,
            report.legs.len(),
            report.artifact_count()
        );
        writeln!(out)?;
        if failed == 0 {
            writeln!(out, "{}", line.green().bold())
        } else {
            writeln!(out, "{}", line.red().bold())
        }
    }

    fn failure_output(&self, out: &mut impl Write, leg: &LegResult) -> io::Result<()> {
        if let Some(work_dir) = &leg.work_dir {
            writeln!(out, "      working tree kept at {}", work_dir.display())?;
        }
        if let Some(code) = leg.output.exit_code {
            writeln!(out, "      exit code {}", code)?;
        }
        for line in leg.output.tail(FAILURE_TAIL_LINES) {
            writeln!(out, "      {}", line.dimmed())?;
        }
        Ok(())
    }
}
