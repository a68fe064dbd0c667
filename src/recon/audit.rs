use crate::recon::paths::LedgerPaths;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::io::Write;

#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent<'a> {
    pub at: DateTime<Utc>,
    pub run_id: &'a str,
    pub list_id: &'a str,
    pub phase: &'a str,
    pub status: &'a str,
    pub message: &'a str,
}

pub fn append_event(
    paths: &LedgerPaths,
    run_id: &str,
    list_id: &str,
    phase: &str,
    status: &str,
    message: &str,
) -> Result<()> {
    fs::create_dir_all(&paths.logs_dir)
        .with_context(|| format!("failed to create {}", paths.logs_dir.display()))?;
    let event = AuditEvent {
        at: Utc::now(),
        run_id,
        list_id,
        phase,
        status,
        message,
    };

    let line = format!("{}\n", serde_json::to_string(&event)?);
    let path = paths.logs_dir.join("audit.log");
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    file.write_all(line.as_bytes())?;
    Ok(())
}

/// Audit failures never fail a run; they are logged and dropped.
pub fn record(paths: &LedgerPaths, run_id: &str, list_id: &str, phase: &str, status: &str, message: &str) {
    if let Err(err) = append_event(paths, run_id, list_id, phase, status, message) {
        tracing::warn!(run_id, phase, error = %format!("{err:#}"), "audit append failed");
    }
}
