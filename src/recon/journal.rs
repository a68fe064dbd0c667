//! Durable per-run records under `state/runs/<run_id>.json`.

use crate::error::FailureCategory;
use crate::recon::model::ReconciliationStatus;
use crate::recon::paths::LedgerPaths;
use crate::recon::util::write_json_atomic;
use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    Running,
    Staged,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Staged => "STAGED",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    fn can_advance_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Running, Self::Staged)
                | (Self::Staged, Self::Succeeded)
        ) || (!self.is_terminal() && next == Self::Failed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub schema_version: u32,
    pub run_id: String,
    pub list_id: String,
    pub status: RunStatus,
    pub catalog_snapshot: String,
    #[serde(default)]
    pub catalog_snapshot_id: Option<String>,
    pub inventory_report_id: String,
    pub grace_period_secs: u64,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub counts_by_category: BTreeMap<ReconciliationStatus, u64>,
    #[serde(default)]
    pub suppressed_orphans: u64,
    #[serde(default)]
    pub failure_category: Option<FailureCategory>,
    #[serde(default)]
    pub error: Option<String>,
}

impl RunRecord {
    pub fn new(
        run_id: &str,
        list_id: &str,
        catalog_snapshot: &str,
        inventory_report_id: &str,
        grace_period_secs: u64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            schema_version: 1,
            run_id: run_id.to_string(),
            list_id: list_id.to_string(),
            status: RunStatus::Pending,
            catalog_snapshot: catalog_snapshot.to_string(),
            catalog_snapshot_id: None,
            inventory_report_id: inventory_report_id.to_string(),
            grace_period_secs,
            started_at: now,
            updated_at: now,
            finished_at: None,
            counts_by_category: BTreeMap::new(),
            suppressed_orphans: 0,
            failure_category: None,
            error: None,
        }
    }

    pub fn advance(&mut self, next: RunStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_advance_to(next) {
            bail!(
                "run {} cannot move from {} to {}",
                self.run_id,
                self.status,
                next
            );
        }
        self.status = next;
        self.updated_at = now;
        if next.is_terminal() {
            self.finished_at = Some(now);
        }
        Ok(())
    }

    pub fn fail(
        &mut self,
        category: FailureCategory,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.advance(RunStatus::Failed, now)?;
        self.failure_category = Some(category);
        self.error = Some(error.into());
        Ok(())
    }
}

pub fn run_file_path(paths: &LedgerPaths, run_id: &str) -> PathBuf {
    paths.runs_dir().join(format!("{run_id}.json"))
}

pub fn save(paths: &LedgerPaths, record: &RunRecord) -> Result<PathBuf> {
    let file = run_file_path(paths, &record.run_id);
    write_json_atomic(&file, record)?;
    Ok(file)
}

pub fn load(paths: &LedgerPaths, run_id: &str) -> Result<RunRecord> {
    let file = run_file_path(paths, run_id);
    let raw =
        fs::read_to_string(&file).with_context(|| format!("failed to read {}", file.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", file.display()))
}

/// Most recent runs first.
pub fn list(paths: &LedgerPaths, limit: usize) -> Result<Vec<RunRecord>> {
    let dir = paths.runs_dir();
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut records = Vec::new();
    for entry in fs::read_dir(&dir).with_context(|| format!("failed to read {}", dir.display()))? {
        let path = entry?.path();
        let is_record = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(".json") && !n.starts_with('.'));
        if !is_record {
            continue;
        }
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        match serde_json::from_str::<RunRecord>(&raw) {
            Ok(record) => records.push(record),
            Err(err) => tracing::warn!(path = %path.display(), error = %err, "skipping unreadable run record"),
        }
    }
    records.sort_by(|a, b| {
        b.started_at
            .cmp(&a.started_at)
            .then_with(|| b.run_id.cmp(&a.run_id))
    });
    records.truncate(limit);
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_770_000_000 + secs, 0).expect("ts")
    }

    #[test]
    fn lifecycle_only_moves_forward() {
        let mut record = RunRecord::new("run-1", "default", "latest", "r1", 24, at(0));
        record.advance(RunStatus::Running, at(1)).expect("running");
        assert!(record.advance(RunStatus::Succeeded, at(2)).is_err());
        record.advance(RunStatus::Staged, at(2)).expect("staged");
        record.advance(RunStatus::Succeeded, at(3)).expect("succeeded");
        assert_eq!(record.finished_at, Some(at(3)));
        assert!(
            record
                .fail(FailureCategory::TransientIo, "late", at(4))
                .is_err()
        );
    }

    #[test]
    fn failed_run_keeps_category_and_message() {
        let mut record = RunRecord::new("run-1", "default", "latest", "r1", 24, at(0));
        record.advance(RunStatus::Running, at(1)).expect("running");
        record
            .fail(FailureCategory::DataIntegrity, "unsorted catalog", at(2))
            .expect("fail");
        assert_eq!(record.status, RunStatus::Failed);
        assert_eq!(record.failure_category, Some(FailureCategory::DataIntegrity));
    }

    #[test]
    fn list_returns_newest_first() {
        let tmp = tempdir().expect("tempdir");
        let paths = LedgerPaths::under(tmp.path());
        for (idx, id) in ["run-a", "run-b", "run-c"].iter().enumerate() {
            let record = RunRecord::new(id, "default", "latest", "r1", 24, at(idx as i64));
            save(&paths, &record).expect("save");
        }
        fs::write(paths.runs_dir().join("run-a.results.jsonl"), "").expect("results");

        let runs = list(&paths, 2).expect("list");
        let ids: Vec<&str> = runs.iter().map(|r| r.run_id.as_str()).collect();
        assert_eq!(ids, vec!["run-c", "run-b"]);
        assert_eq!(load(&paths, "run-a").expect("load").status, RunStatus::Pending);
    }
}
