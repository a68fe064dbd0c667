//! The current archive list: immutable generation files plus one pointer.
//!
//! A run stages CONFIRMED entries into a temp file inside the list
//! directory. Nothing becomes visible until [`StagedList::commit`] renames
//! the generation into place and then swaps the pointer. Readers only ever
//! follow the pointer, so they see the previous list or the new one.

use crate::recon::util::{file_sha256, persist_staged, staging_file_for, write_json_atomic};
use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

pub const POINTER_FILE: &str = "current.json";
const GENERATIONS_DIR: &str = "generations";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListEntry {
    pub key: String,
    pub storage_class: String,
    pub checksum: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListPointer {
    pub list_id: String,
    pub run_id: String,
    pub generation: String,
    pub entry_count: u64,
    pub committed_at: DateTime<Utc>,
    pub sha256: String,
}

fn pointer_path(dir: &Path) -> PathBuf {
    dir.join(POINTER_FILE)
}

fn generations_dir(dir: &Path) -> PathBuf {
    dir.join(GENERATIONS_DIR)
}

pub fn load_pointer(dir: &Path) -> Result<Option<ListPointer>> {
    let path = pointer_path(dir);
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let pointer = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(Some(pointer))
}

pub struct ArchiveListBuilder {
    dir: PathBuf,
    list_id: String,
    run_id: String,
    generation: String,
    out: BufWriter<NamedTempFile>,
    hasher: Sha256,
    count: u64,
}

impl ArchiveListBuilder {
    /// Open a staging file for a new generation. The live list is untouched.
    pub fn begin(dir: &Path, list_id: &str, run_id: &str, started_at: DateTime<Utc>) -> Result<Self> {
        let gen_dir = generations_dir(dir);
        let generation = format!(
            "{}-{}.jsonl",
            started_at.format("%Y%m%dT%H%M%S%3fZ"),
            run_id
        );
        let staged = staging_file_for(&gen_dir.join(&generation))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            list_id: list_id.to_string(),
            run_id: run_id.to_string(),
            generation,
            out: BufWriter::new(staged),
            hasher: Sha256::new(),
            count: 0,
        })
    }

    pub fn stage(&mut self, entry: &ListEntry) -> Result<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        self.hasher.update(&line);
        self.out
            .write_all(&line)
            .with_context(|| format!("failed to stage archive list `{}`", self.list_id))?;
        self.count += 1;
        Ok(())
    }

    /// Flush the staging file. Dropping the result instead of committing it
    /// deletes the staged generation.
    pub fn finish(self, committed_at: DateTime<Utc>) -> Result<StagedList> {
        let file = self
            .out
            .into_inner()
            .map_err(|err| err.into_error())
            .context("failed to flush staged archive list")?;
        Ok(StagedList {
            dir: self.dir,
            file,
            pointer: ListPointer {
                list_id: self.list_id,
                run_id: self.run_id,
                generation: self.generation,
                entry_count: self.count,
                committed_at,
                sha256: format!("{:x}", self.hasher.finalize()),
            },
        })
    }
}

pub struct StagedList {
    dir: PathBuf,
    file: NamedTempFile,
    pointer: ListPointer,
}

impl StagedList {
    /// Move the generation into place, then swap the pointer.
    pub fn commit(self) -> Result<ListPointer> {
        let gen_path = generations_dir(&self.dir).join(&self.pointer.generation);
        persist_staged(self.file, &gen_path)?;
        write_json_atomic(&pointer_path(&self.dir), &self.pointer)?;
        Ok(self.pointer)
    }
}

/// Remove old generations, keeping the live one plus the newest others up to `keep` in total.
pub fn prune_generations(dir: &Path, keep: usize) -> Result<Vec<String>> {
    let gen_dir = generations_dir(dir);
    if !gen_dir.exists() {
        return Ok(Vec::new());
    }
    let live = load_pointer(dir)?.map(|p| p.generation);

    let mut names = Vec::new();
    for entry in fs::read_dir(&gen_dir)
        .with_context(|| format!("failed to read {}", gen_dir.display()))?
    {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.ends_with(".jsonl") && entry.path().is_file() {
            names.push(name);
        }
    }
    // Names start with the run start time, so lexical order is age order.
    names.sort();
    names.reverse();

    let mut kept = usize::from(live.is_some());
    let mut removed = Vec::new();
    for name in names {
        if live.as_deref() == Some(name.as_str()) {
            continue;
        }
        if kept < keep {
            kept += 1;
            continue;
        }
        let path = gen_dir.join(&name);
        fs::remove_file(&path).with_context(|| format!("failed to remove {}", path.display()))?;
        removed.push(name);
    }
    Ok(removed)
}

/// Delete staging files a killed run left behind. Call with the list's run
/// lock held and before a new builder begins.
pub fn sweep_staging(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    for (scan, generations) in [(dir.to_path_buf(), false), (generations_dir(dir), true)] {
        if !scan.is_dir() {
            continue;
        }
        for entry in
            fs::read_dir(&scan).with_context(|| format!("failed to read {}", scan.display()))?
        {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let stale = if generations {
                !name.ends_with(".jsonl")
            } else {
                name.starts_with(".tmp")
            };
            if stale {
                fs::remove_file(&path)
                    .with_context(|| format!("failed to remove {}", path.display()))?;
                removed.push(path);
            }
        }
    }
    Ok(removed)
}

/// Read side of the current list, loaded from the generation the pointer names.
#[derive(Debug, Clone)]
pub struct ArchiveList {
    pointer: ListPointer,
    entries: Vec<ListEntry>,
}

impl ArchiveList {
    /// `Ok(None)` when no run has committed a list yet.
    pub fn open(dir: &Path) -> Result<Option<Self>> {
        let Some(pointer) = load_pointer(dir)? else {
            return Ok(None);
        };
        let path = generations_dir(dir).join(&pointer.generation);
        let digest = file_sha256(&path)?;
        if digest != pointer.sha256 {
            bail!(
                "archive list generation {} does not match its pointer digest",
                path.display()
            );
        }

        let file =
            fs::File::open(&path).with_context(|| format!("failed to open {}", path.display()))?;
        let mut entries = Vec::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line.with_context(|| format!("failed to read {}", path.display()))?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: ListEntry = serde_json::from_str(&line)
                .with_context(|| format!("{} line {} is not a list entry", path.display(), idx + 1))?;
            entries.push(entry);
        }
        if entries.len() as u64 != pointer.entry_count {
            bail!(
                "archive list generation {} has {} entries, pointer says {}",
                path.display(),
                entries.len(),
                pointer.entry_count
            );
        }
        Ok(Some(Self { pointer, entries }))
    }

    pub fn pointer(&self) -> &ListPointer {
        &self.pointer
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[ListEntry] {
        &self.entries
    }

    /// Entries are staged in merge order, so lookups can bisect.
    pub fn get(&self, key: &str) -> Option<&ListEntry> {
        self.entries
            .binary_search_by(|e| e.key.as_bytes().cmp(key.as_bytes()))
            .ok()
            .map(|idx| &self.entries[idx])
    }

    pub fn by_class<'a>(&'a self, class: &'a str) -> impl Iterator<Item = &'a ListEntry> + 'a {
        self.entries.iter().filter(move |e| e.storage_class == class)
    }

    pub fn counts_by_class(&self) -> BTreeMap<String, u64> {
        let mut counts = BTreeMap::new();
        for entry in &self.entries {
            *counts.entry(entry.storage_class.clone()).or_insert(0) += 1;
        }
        counts
    }
}
