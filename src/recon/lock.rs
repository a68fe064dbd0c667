//! Exclusive per-list run lock backed by an advisory file lock.

use crate::error::ReconError;
use crate::recon::paths::LedgerPaths;
use anyhow::Context;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockPayload {
    pub pid: u32,
    pub run_id: String,
    pub build_uuid: String,
    pub started_at: DateTime<Utc>,
}

impl LockPayload {
    fn describe(&self) -> String {
        format!("pid={} run={} since={}", self.pid, self.run_id, self.started_at.to_rfc3339())
    }
}

pub fn lock_path(paths: &LedgerPaths, list_id: &str) -> PathBuf {
    paths.locks_dir().join(format!("{list_id}.lock"))
}

fn read_payload(file: &mut File) -> Option<LockPayload> {
    let mut raw = String::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_string(&mut raw).ok()?;
    serde_json::from_str(&raw).ok()
}

fn open_lock_file(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
}

/// Held for the whole run; released when dropped.
#[derive(Debug)]
pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(
        paths: &LedgerPaths,
        list_id: &str,
        run_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Self, ReconError> {
        let path = lock_path(paths, list_id);
        let mut file = open_lock_file(&path)
            .map_err(|err| ReconError::transient(format!("open {}", path.display()), err))?;

        if let Err(err) = file.try_lock_exclusive() {
            if err.kind() != fs2::lock_contended_error().kind() {
                return Err(ReconError::transient(format!("lock {}", path.display()), err));
            }
            let holder = read_payload(&mut file)
                .map(|p| p.describe())
                .unwrap_or_else(|| "unknown holder".to_string());
            return Err(ReconError::ConcurrencyConflict {
                list_id: list_id.to_string(),
                holder,
            });
        }

        let payload = LockPayload {
            pid: std::process::id(),
            run_id: run_id.to_string(),
            build_uuid: env!("BUILD_UUID").to_string(),
            started_at: now,
        };
        let written = serde_json::to_vec(&payload)
            .context("failed to encode lock payload")
            .and_then(|bytes| {
                file.set_len(0)?;
                file.seek(SeekFrom::Start(0))?;
                file.write_all(&bytes)?;
                file.sync_all()?;
                Ok(())
            });
        if let Err(err) = written {
            let _ = FileExt::unlock(&file);
            return Err(ReconError::transient(
                format!("write {}", path.display()),
                format!("{err:#}"),
            ));
        }

        tracing::debug!(list_id, run_id, path = %path.display(), "run lock acquired");
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockState {
    Free,
    Held(Option<LockPayload>),
}

/// Probe the lock without keeping it. Used by `status`.
pub fn inspect(paths: &LedgerPaths, list_id: &str) -> anyhow::Result<LockState> {
    let path = lock_path(paths, list_id);
    if !path.exists() {
        return Ok(LockState::Free);
    }
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    match file.try_lock_exclusive() {
        Ok(()) => {
            let _ = FileExt::unlock(&file);
            Ok(LockState::Free)
        }
        Err(err) if err.kind() == fs2::lock_contended_error().kind() => {
            Ok(LockState::Held(read_payload(&mut file)))
        }
        Err(err) => Err(err).with_context(|| format!("failed to probe {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureCategory;
    use tempfile::tempdir;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_770_000_000, 0).expect("ts")
    }

    #[test]
    fn second_acquire_is_a_concurrency_conflict() {
        let tmp = tempdir().expect("tempdir");
        let paths = LedgerPaths::under(tmp.path());

        let held = RunLock::acquire(&paths, "default", "run-1", now()).expect("first");
        let err = RunLock::acquire(&paths, "default", "run-2", now()).expect_err("second");
        assert_eq!(err.category(), FailureCategory::ConcurrencyConflict);
        assert!(err.to_string().contains("run=run-1"));

        match inspect(&paths, "default").expect("inspect") {
            LockState::Held(Some(payload)) => assert_eq!(payload.run_id, "run-1"),
            other => panic!("unexpected lock state {other:?}"),
        }

        drop(held);
        assert_eq!(inspect(&paths, "default").expect("inspect"), LockState::Free);
        RunLock::acquire(&paths, "default", "run-3", now()).expect("after release");
    }

    #[test]
    fn locks_are_per_list() {
        let tmp = tempdir().expect("tempdir");
        let paths = LedgerPaths::under(tmp.path());
        let _a = RunLock::acquire(&paths, "east", "run-1", now()).expect("east");
        let _b = RunLock::acquire(&paths, "west", "run-2", now()).expect("west");
    }
}
