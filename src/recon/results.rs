//! Per-run result log: one immutable JSON line per classified key.

use crate::recon::model::ReconciliationResult;
use crate::recon::paths::LedgerPaths;
use crate::recon::util::{persist_staged, staging_file_for};
use anyhow::{Context, Result};
use std::fs;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;
use tempfile::NamedTempFile;

pub fn results_file(paths: &LedgerPaths, run_id: &str) -> PathBuf {
    paths.runs_dir().join(format!("{run_id}.results.jsonl"))
}

/// Buffers results in a staging file; they only appear under the run's name
/// once [`ResultLog::seal`] succeeds.
pub struct ResultLog {
    path: PathBuf,
    out: BufWriter<NamedTempFile>,
    written: u64,
}

impl ResultLog {
    pub fn create(paths: &LedgerPaths, run_id: &str) -> Result<Self> {
        let path = results_file(paths, run_id);
        let staged = staging_file_for(&path)?;
        Ok(Self {
            path,
            out: BufWriter::new(staged),
            written: 0,
        })
    }

    pub fn append(&mut self, result: &ReconciliationResult) -> Result<()> {
        serde_json::to_writer(&mut self.out, result)?;
        self.out
            .write_all(b"\n")
            .with_context(|| format!("failed to stage {}", self.path.display()))?;
        self.written += 1;
        Ok(())
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn seal(self) -> Result<PathBuf> {
        let staged = self
            .out
            .into_inner()
            .map_err(|err| err.into_error())
            .with_context(|| format!("failed to flush {}", self.path.display()))?;
        persist_staged(staged, &self.path)?;
        Ok(self.path)
    }
}

pub fn read_results(paths: &LedgerPaths, run_id: &str) -> Result<Vec<ReconciliationResult>> {
    let path = results_file(paths, run_id);
    let file = fs::File::open(&path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut out = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line.with_context(|| format!("failed to read {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        out.push(
            serde_json::from_str(&line)
                .with_context(|| format!("bad result row in {}", path.display()))?,
        );
    }
    Ok(out)
}
