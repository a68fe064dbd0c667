//! Catalog side of a run: which objects should be in cold storage.

use crate::error::ReconError;
use crate::recon::model::{ArchiveRecord, ResumeToken};
use crate::recon::prefetch::PageSource;
use crate::recon::retry::{RetryPolicy, with_retry};
use serde::Deserialize;
use std::fs;
use std::io::{BufRead, BufReader, ErrorKind, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotRef {
    Latest,
    Id(String),
}

impl SnapshotRef {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.eq_ignore_ascii_case("latest") {
            Self::Latest
        } else {
            Self::Id(trimmed.to_string())
        }
    }
}

impl std::fmt::Display for SnapshotRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Latest => f.write_str("latest"),
            Self::Id(id) => f.write_str(id),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CatalogPage {
    pub rows: Vec<ArchiveRecord>,
    /// `None` once the snapshot is exhausted.
    pub next: Option<ResumeToken>,
}

/// Read-only, paginated view of the relational catalog.
///
/// Rows come back in the store's key order; the store does not re-sort.
pub trait CatalogStore: Send + Sync {
    fn resolve_snapshot(&self, snapshot: &SnapshotRef) -> Result<String, ReconError>;

    fn fetch_page(
        &self,
        snapshot_id: &str,
        from: ResumeToken,
        limit: usize,
    ) -> Result<CatalogPage, ReconError>;
}

/// Catalog exported as one JSON-lines file per snapshot, `<dir>/<snapshot_id>.jsonl`.
///
/// Resume tokens are byte offsets into the export.
#[derive(Debug, Clone)]
pub struct FsCatalogStore {
    dir: PathBuf,
}

impl FsCatalogStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn snapshot_path(&self, snapshot_id: &str) -> PathBuf {
        self.dir.join(format!("{snapshot_id}.jsonl"))
    }
}

#[derive(Debug, Deserialize)]
struct CatalogRow {
    key: String,
    expected_storage_class: String,
    expected_checksum: String,
    inserted_at: chrono::DateTime<chrono::Utc>,
}

fn snapshot_id_is_safe(id: &str) -> bool {
    !id.is_empty()
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
}

fn parse_row(snapshot_id: &str, offset: u64, line: &[u8]) -> Result<ArchiveRecord, ReconError> {
    let malformed = |reason: String| ReconError::CatalogRecordMalformed {
        snapshot: snapshot_id.to_string(),
        offset,
        reason,
    };
    let row: CatalogRow = serde_json::from_slice(line).map_err(|err| malformed(err.to_string()))?;
    if row.key.is_empty() {
        return Err(malformed("empty key".to_string()));
    }
    if row.expected_storage_class.trim().is_empty() {
        return Err(malformed(format!("key `{}` has no expected storage class", row.key)));
    }
    Ok(ArchiveRecord {
        key: row.key,
        expected_storage_class: row.expected_storage_class,
        expected_checksum: row.expected_checksum,
        inserted_at: row.inserted_at,
    })
}

impl CatalogStore for FsCatalogStore {
    fn resolve_snapshot(&self, snapshot: &SnapshotRef) -> Result<String, ReconError> {
        match snapshot {
            SnapshotRef::Id(id) => {
                if !snapshot_id_is_safe(id) {
                    return Err(ReconError::InvalidSnapshot(id.clone()));
                }
                match fs::metadata(self.snapshot_path(id)) {
                    Ok(meta) if meta.is_file() => Ok(id.clone()),
                    Ok(_) => Err(ReconError::InvalidSnapshot(id.clone())),
                    Err(err) if err.kind() == ErrorKind::NotFound => {
                        Err(ReconError::InvalidSnapshot(id.clone()))
                    }
                    Err(err) => Err(ReconError::transient("stat catalog snapshot", err)),
                }
            }
            SnapshotRef::Latest => {
                let entries = match fs::read_dir(&self.dir) {
                    Ok(entries) => entries,
                    Err(err) if err.kind() == ErrorKind::NotFound => {
                        return Err(ReconError::InvalidSnapshot("latest".to_string()));
                    }
                    Err(err) => return Err(ReconError::transient("list catalog snapshots", err)),
                };
                let mut latest: Option<String> = None;
                for entry in entries {
                    let path = entry
                        .map_err(|err| ReconError::transient("list catalog snapshots", err))?
                        .path();
                    if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                        continue;
                    }
                    let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                        continue;
                    };
                    if !snapshot_id_is_safe(stem) {
                        continue;
                    }
                    if latest.as_deref().is_none_or(|best| stem > best) {
                        latest = Some(stem.to_string());
                    }
                }
                latest.ok_or_else(|| ReconError::InvalidSnapshot("latest".to_string()))
            }
        }
    }

    fn fetch_page(
        &self,
        snapshot_id: &str,
        from: ResumeToken,
        limit: usize,
    ) -> Result<CatalogPage, ReconError> {
        let path = self.snapshot_path(snapshot_id);
        let file = match fs::File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(ReconError::InvalidSnapshot(snapshot_id.to_string()));
            }
            Err(err) => return Err(ReconError::transient("open catalog snapshot", err)),
        };
        let mut reader = BufReader::new(file);
        reader
            .seek(SeekFrom::Start(from.position))
            .map_err(|err| ReconError::transient("seek catalog snapshot", err))?;

        let mut rows = Vec::with_capacity(limit.min(4096));
        let mut offset = from.position;
        // Rows stay bytes until serde sees them, so bad UTF-8 is a malformed
        // row rather than a read failure.
        let mut line = Vec::new();
        while rows.len() < limit {
            line.clear();
            let read = reader
                .read_until(b'\n', &mut line)
                .map_err(|err| ReconError::transient("read catalog snapshot", err))?;
            if read == 0 {
                return Ok(CatalogPage { rows, next: None });
            }
            let row_offset = offset;
            offset += read as u64;
            let trimmed = line.trim_ascii();
            if trimmed.is_empty() {
                continue;
            }
            rows.push(parse_row(snapshot_id, row_offset, trimmed)?);
        }

        Ok(CatalogPage {
            rows,
            next: Some(ResumeToken { position: offset }),
        })
    }
}

/// Lazy, restartable cursor over one catalog snapshot.
pub struct CatalogReader {
    store: Arc<dyn CatalogStore>,
    snapshot_id: String,
    next: Option<ResumeToken>,
    page_size: usize,
    retry: RetryPolicy,
}

fn escalate((attempts, err): (u32, ReconError)) -> ReconError {
    match err {
        ReconError::TransientIo { op, reason } => ReconError::CatalogUnavailable {
            attempts,
            reason: format!("{op}: {reason}"),
        },
        other => other,
    }
}

impl CatalogReader {
    pub fn open(
        store: Arc<dyn CatalogStore>,
        snapshot: &SnapshotRef,
        page_size: usize,
        retry: RetryPolicy,
    ) -> Result<Self, ReconError> {
        let snapshot_id =
            with_retry(&retry, "resolve catalog snapshot", || store.resolve_snapshot(snapshot))
                .map_err(escalate)?;
        Ok(Self {
            store,
            snapshot_id,
            next: Some(ResumeToken::start()),
            page_size: page_size.max(1),
            retry,
        })
    }

    /// Continue a snapshot from a token handed out by an earlier reader.
    pub fn resume_from(mut self, token: ResumeToken) -> Self {
        self.next = Some(token);
        self
    }

    pub fn snapshot_id(&self) -> &str {
        &self.snapshot_id
    }

    pub fn resume_token(&self) -> Option<ResumeToken> {
        self.next
    }
}

impl PageSource for CatalogReader {
    type Row = ArchiveRecord;

    fn next_page(&mut self) -> Result<Option<Vec<ArchiveRecord>>, ReconError> {
        let Some(from) = self.next else {
            return Ok(None);
        };
        let page = with_retry(&self.retry, "fetch catalog page", || {
            self.store.fetch_page(&self.snapshot_id, from, self.page_size)
        })
        .map_err(escalate)?;
        self.next = page.next;
        Ok(Some(page.rows))
    }
}
