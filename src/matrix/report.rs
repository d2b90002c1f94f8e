//! Aggregated outcome of a matrix run.

use super::dispatch::ArgumentString;
use super::leg::LegResult;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Clone, Debug, Serialize)]
pub struct MatrixReport {
    pub run_id: String,
    pub args: ArgumentString,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// `false` if any leg failed
    pub succeeded: bool,
    pub legs: BTreeMap<String, LegResult>,
}

impl MatrixReport {
    /// Folds joined leg results into a report. Each leg owns exactly one key.
    pub fn new(
        run_id: String,
        args: ArgumentString,
        started_at: DateTime<Utc>,
        results: Vec<LegResult>,
    ) -> Self {
        let legs: BTreeMap<String, LegResult> = results
            .into_iter()
            .map(|result| (result.platform.id.clone(), result))
            .collect();
        let succeeded = legs.values().all(LegResult::succeeded);
        Self {
            run_id,
            args,
            started_at,
            finished_at: Utc::now(),
            succeeded,
            legs,
        }
    }

    pub fn leg(&self, id: &str) -> Option<&LegResult> {
        self.legs.get(id)
    }

    pub fn failed_legs(&self) -> impl Iterator<Item = &LegResult> {
        self.legs.values().filter(|leg| !leg.succeeded())
    }

    pub fn artifact_count(&self) -> usize {
        self.legs.values().map(|leg| leg.artifacts.len()).sum()
    }

    /// Process exit code for the run: `0` when every leg succeeded.
    pub fn exit_code(&self) -> i32 {
        if self.succeeded { 0 } else { 1 }
    }

    /// Writes the report as pretty JSON, creating parent directories.
    pub async fn write_json(&self, path: &Path) -> crate::error::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }
}
