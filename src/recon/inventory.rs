//! Storage side of a run: what an inventory report says is actually present.
//!
//! A report is a manifest plus one or more part files. Every part must be
//! present and match the manifest's declared size and SHA-256 before a single
//! entry is handed out; a partial report would manufacture false
//! MISSING_FROM_STORAGE results. Parts are each sorted by key and are k-way
//! merged into one ordered stream.

use crate::error::ReconError;
use crate::recon::model::{InventoryEntry, ResumeToken, normalize_checksum, qualified_key};
use crate::recon::prefetch::PageSource;
use crate::recon::retry::{RetryPolicy, with_retry};
use crate::recon::util::sha256_reader;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::fs;
use sha2::{Digest, Sha256};
use std::io::{self, BufRead, BufReader, ErrorKind, Read};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

pub const MANIFEST_FILE: &str = "manifest.json";
const SUPPORTED_FORMAT: &str = "jsonl";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestPart {
    pub key: String,
    pub size: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryManifest {
    pub report_id: String,
    pub source_bucket: String,
    pub generated_at: DateTime<Utc>,
    #[serde(default = "default_file_format")]
    pub file_format: String,
    pub files: Vec<ManifestPart>,
}

fn default_file_format() -> String {
    SUPPORTED_FORMAT.to_string()
}

pub trait InventoryStore: Send + Sync {
    fn load_manifest(&self, report_id: &str) -> Result<InventoryManifest, ReconError>;

    fn open_part(&self, report_id: &str, part_key: &str)
    -> Result<Box<dyn Read + Send>, ReconError>;
}

/// Reports laid out as `<dir>/<report_id>/manifest.json` plus part files
/// relative to the report directory.
#[derive(Debug, Clone)]
pub struct FsInventoryStore {
    dir: PathBuf,
}

impl FsInventoryStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn report_dir(&self, report_id: &str) -> PathBuf {
        self.dir.join(report_id)
    }
}

fn report_id_is_safe(id: &str) -> bool {
    !id.is_empty()
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
}

fn part_key_is_safe(key: &str) -> bool {
    !key.is_empty()
        && Path::new(key)
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
}

impl InventoryStore for FsInventoryStore {
    fn load_manifest(&self, report_id: &str) -> Result<InventoryManifest, ReconError> {
        if !report_id_is_safe(report_id) {
            return Err(ReconError::UnknownInventoryReport(report_id.to_string()));
        }
        let path = self.report_dir(report_id).join(MANIFEST_FILE);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(ReconError::UnknownInventoryReport(report_id.to_string()));
            }
            Err(err) => return Err(ReconError::transient("read inventory manifest", err)),
        };
        serde_json::from_str(&raw).map_err(|err| ReconError::InventoryReportMalformed {
            report: report_id.to_string(),
            part: MANIFEST_FILE.to_string(),
            line: err.line() as u64,
            reason: err.to_string(),
        })
    }

    fn open_part(
        &self,
        report_id: &str,
        part_key: &str,
    ) -> Result<Box<dyn Read + Send>, ReconError> {
        if !part_key_is_safe(part_key) {
            return Err(ReconError::InventoryReportMalformed {
                report: report_id.to_string(),
                part: part_key.to_string(),
                line: 0,
                reason: "part key must be a relative path inside the report".to_string(),
            });
        }
        let path = self.report_dir(report_id).join(part_key);
        match fs::File::open(&path) {
            Ok(file) => Ok(Box::new(file)),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(ReconError::InventoryReportIncomplete {
                    report: report_id.to_string(),
                    reason: format!("declared part `{part_key}` is missing"),
                })
            }
            Err(err) => Err(ReconError::transient("open inventory part", err)),
        }
    }
}

#[derive(Debug, Deserialize)]
struct InventoryRow {
    bucket: String,
    key: String,
    size: u64,
    last_modified: DateTime<Utc>,
    #[serde(alias = "e_tag", alias = "etag")]
    checksum: String,
    storage_class: String,
}

/// Check the manifest itself and every declared part against it.
pub fn validate_report(
    store: &dyn InventoryStore,
    report_id: &str,
    retry: &RetryPolicy,
) -> Result<InventoryManifest, ReconError> {
    let manifest = with_retry(retry, "load inventory manifest", || {
        store.load_manifest(report_id)
    })
    .map_err(|(_, err)| err)?;

    let malformed_manifest = |reason: String| ReconError::InventoryReportMalformed {
        report: report_id.to_string(),
        part: MANIFEST_FILE.to_string(),
        line: 0,
        reason,
    };
    if manifest.report_id != report_id {
        return Err(malformed_manifest(format!(
            "manifest describes report `{}`",
            manifest.report_id
        )));
    }
    if manifest.file_format != SUPPORTED_FORMAT {
        return Err(malformed_manifest(format!(
            "unsupported file format `{}`",
            manifest.file_format
        )));
    }

    for part in &manifest.files {
        let reader = with_retry(retry, "open inventory part", || {
            store.open_part(report_id, &part.key)
        })
        .map_err(|(_, err)| err)?;
        let (digest, size) = sha256_reader(reader)
            .map_err(|err| ReconError::transient("checksum inventory part", err))?;
        if size != part.size {
            return Err(ReconError::InventoryReportIncomplete {
                report: report_id.to_string(),
                reason: format!(
                    "part `{}` is {size} bytes, manifest declares {}",
                    part.key, part.size
                ),
            });
        }
        if !digest.eq_ignore_ascii_case(part.sha256.trim()) {
            return Err(ReconError::InventoryReportIncomplete {
                report: report_id.to_string(),
                reason: format!("part `{}` fails its manifest checksum", part.key),
            });
        }
    }

    Ok(manifest)
}

/// Hashes every byte the merge pulls through it.
struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
    bytes: u64,
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }
}

struct PartCursor {
    declared: ManifestPart,
    reader: BufReader<HashingReader<Box<dyn Read + Send>>>,
    line: Vec<u8>,
    line_no: u64,
    drained: bool,
}

impl PartCursor {
    fn new(declared: ManifestPart, inner: Box<dyn Read + Send>) -> Self {
        Self {
            declared,
            reader: BufReader::new(HashingReader {
                inner,
                hasher: Sha256::new(),
                bytes: 0,
            }),
            line: Vec::new(),
            line_no: 0,
            drained: false,
        }
    }

    /// The bytes merged must be the bytes validated against the manifest.
    fn verify_drained(&mut self, report_id: &str) -> Result<(), ReconError> {
        self.drained = true;
        let seen = self.reader.get_mut();
        let digest = format!("{:x}", std::mem::take(&mut seen.hasher).finalize());
        if seen.bytes != self.declared.size
            || !digest.eq_ignore_ascii_case(self.declared.sha256.trim())
        {
            return Err(ReconError::InventoryReportIncomplete {
                report: report_id.to_string(),
                reason: format!(
                    "part `{}` changed while it was being read ({} bytes, manifest declares {})",
                    self.declared.key, seen.bytes, self.declared.size
                ),
            });
        }
        Ok(())
    }
}

struct Head {
    entry: InventoryEntry,
    part: usize,
}

impl PartialEq for Head {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Head {}

impl PartialOrd for Head {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Head {
    fn cmp(&self, other: &Self) -> Ordering {
        self.entry
            .key
            .as_bytes()
            .cmp(other.entry.key.as_bytes())
            .then(self.part.cmp(&other.part))
    }
}

/// Lazy merged cursor over a validated report.
pub struct InventoryReader {
    report_id: String,
    generated_at: DateTime<Utc>,
    parts: Vec<PartCursor>,
    heap: BinaryHeap<Reverse<Head>>,
    consumed: u64,
    page_size: usize,
}

impl InventoryReader {
    pub fn open(
        store: Arc<dyn InventoryStore>,
        report_id: &str,
        page_size: usize,
        retry: RetryPolicy,
    ) -> Result<Self, ReconError> {
        Self::open_at(store, report_id, page_size, retry, ResumeToken::start())
    }

    pub fn open_at(
        store: Arc<dyn InventoryStore>,
        report_id: &str,
        page_size: usize,
        retry: RetryPolicy,
        from: ResumeToken,
    ) -> Result<Self, ReconError> {
        let manifest = validate_report(store.as_ref(), report_id, &retry)?;

        let mut parts = Vec::with_capacity(manifest.files.len());
        for part in &manifest.files {
            let reader = with_retry(&retry, "open inventory part", || {
                store.open_part(report_id, &part.key)
            })
            .map_err(|(_, err)| err)?;
            parts.push(PartCursor::new(part.clone(), reader));
        }

        let mut reader = Self {
            report_id: report_id.to_string(),
            generated_at: manifest.generated_at,
            parts,
            heap: BinaryHeap::new(),
            consumed: 0,
            page_size: page_size.max(1),
        };
        for idx in 0..reader.parts.len() {
            reader.refill(idx)?;
        }
        while reader.consumed < from.position {
            if reader.next_entry()?.is_none() {
                break;
            }
        }
        tracing::debug!(
            report = %reader.report_id,
            parts = reader.parts.len(),
            skipped = reader.consumed,
            "inventory report opened"
        );
        Ok(reader)
    }

    pub fn report_id(&self) -> &str {
        &self.report_id
    }

    pub fn resume_token(&self) -> ResumeToken {
        ResumeToken {
            position: self.consumed,
        }
    }

    fn refill(&mut self, idx: usize) -> Result<(), ReconError> {
        let cursor = &mut self.parts[idx];
        if cursor.drained {
            return Ok(());
        }
        loop {
            cursor.line.clear();
            let read = cursor
                .reader
                .read_until(b'\n', &mut cursor.line)
                .map_err(|err| ReconError::transient("read inventory part", err))?;
            if read == 0 {
                return cursor.verify_drained(&self.report_id);
            }
            cursor.line_no += 1;
            let trimmed = cursor.line.trim_ascii();
            if trimmed.is_empty() {
                continue;
            }
            let entry = parse_row(
                &self.report_id,
                &cursor.declared.key,
                cursor.line_no,
                trimmed,
                self.generated_at,
            )?;
            self.heap.push(Reverse(Head { entry, part: idx }));
            return Ok(());
        }
    }

    pub fn next_entry(&mut self) -> Result<Option<InventoryEntry>, ReconError> {
        let Some(Reverse(head)) = self.heap.pop() else {
            return Ok(None);
        };
        self.refill(head.part)?;
        self.consumed += 1;
        Ok(Some(head.entry))
    }
}

fn parse_row(
    report_id: &str,
    part: &str,
    line_no: u64,
    line: &[u8],
    generated_at: DateTime<Utc>,
) -> Result<InventoryEntry, ReconError> {
    let malformed = |reason: String| ReconError::InventoryReportMalformed {
        report: report_id.to_string(),
        part: part.to_string(),
        line: line_no,
        reason,
    };
    let row: InventoryRow = serde_json::from_slice(line).map_err(|err| malformed(err.to_string()))?;
    if row.bucket.is_empty() {
        return Err(malformed("empty bucket".to_string()));
    }
    if row.key.is_empty() {
        return Err(malformed("empty key".to_string()));
    }
    if row.storage_class.trim().is_empty() {
        return Err(malformed(format!("key `{}` has no storage class", row.key)));
    }
    Ok(InventoryEntry {
        key: qualified_key(&row.bucket, &row.key),
        storage_class: row.storage_class,
        checksum: normalize_checksum(&row.checksum),
        size: row.size,
        last_modified: row.last_modified,
        report_generated_at: generated_at,
    })
}

impl PageSource for InventoryReader {
    type Row = InventoryEntry;

    fn next_page(&mut self) -> Result<Option<Vec<InventoryEntry>>, ReconError> {
        let mut page = Vec::with_capacity(self.page_size.min(4096));
        while page.len() < self.page_size {
            match self.next_entry()? {
                Some(entry) => page.push(entry),
                None => break,
            }
        }
        if page.is_empty() {
            return Ok(None);
        }
        Ok(Some(page))
    }
}
