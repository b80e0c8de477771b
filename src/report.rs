use crate::{PoolStats, RunSummary, RunnerError, TaskFailure};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const REPORT_FILE: &str = "report.json";

/// Machine-readable record of a finished run, written next to the captures.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total_tasks: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub pool: PoolStats,
    pub failures: Vec<TaskFailure>,
}

impl RunReport {
    pub fn new(started_at: DateTime<Utc>, total_tasks: usize, summary: &RunSummary, pool: PoolStats) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at,
            finished_at: Utc::now(),
            total_tasks,
            succeeded: summary.succeeded,
            failed: summary.failures.len(),
            pool,
            failures: summary.failures.clone(),
        }
    }

    pub async fn write_to(&self, dir: &Path) -> Result<PathBuf, RunnerError> {
        let path = dir.join(REPORT_FILE);
        let json = serde_json::to_vec_pretty(self)?;
        tokio::fs::create_dir_all(dir).await?;
        tokio::fs::write(&path, json).await?;
        Ok(path)
    }
}
