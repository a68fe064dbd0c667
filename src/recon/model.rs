use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// An object the catalog expects to find in cold storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveRecord {
    /// Bucket-qualified path, `bucket/object/key`.
    pub key: String,
    pub expected_storage_class: String,
    pub expected_checksum: String,
    pub inserted_at: DateTime<Utc>,
}

/// An object observed in storage by an inventory report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryEntry {
    pub key: String,
    pub storage_class: String,
    pub checksum: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
    pub report_generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReconciliationStatus {
    Confirmed,
    MissingFromStorage,
    OrphanedInStorage,
    StorageClassMismatch,
    ChecksumMismatch,
}

impl ReconciliationStatus {
    pub const ALL: [Self; 5] = [
        Self::Confirmed,
        Self::MissingFromStorage,
        Self::OrphanedInStorage,
        Self::StorageClassMismatch,
        Self::ChecksumMismatch,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Confirmed => "CONFIRMED",
            Self::MissingFromStorage => "MISSING_FROM_STORAGE",
            Self::OrphanedInStorage => "ORPHANED_IN_STORAGE",
            Self::StorageClassMismatch => "STORAGE_CLASS_MISMATCH",
            Self::ChecksumMismatch => "CHECKSUM_MISMATCH",
        }
    }

    pub fn is_anomaly(self) -> bool {
        self != Self::Confirmed
    }
}

impl fmt::Display for ReconciliationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One classified key of one run. Written once, never rewritten.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationResult {
    pub key: String,
    pub status: ReconciliationStatus,
    pub run_id: String,
    pub catalog_snapshot_id: String,
    pub inventory_report_id: String,
    pub detected_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_storage_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_storage_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_checksum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_checksum: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub anomaly_suppressed: bool,
}

/// Opaque position in a paginated source. Encoded as `pos:<n>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResumeToken {
    pub position: u64,
}

impl ResumeToken {
    pub fn start() -> Self {
        Self::default()
    }

    pub fn advanced_by(self, rows: usize) -> Self {
        Self {
            position: self.position + rows as u64,
        }
    }
}

impl fmt::Display for ResumeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pos:{}", self.position)
    }
}

impl FromStr for ResumeToken {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s
            .strip_prefix("pos:")
            .ok_or_else(|| format!("resume token `{s}` lacks the `pos:` prefix"))?;
        let position = raw
            .parse::<u64>()
            .map_err(|err| format!("resume token `{s}` is invalid: {err}"))?;
        Ok(Self { position })
    }
}

/// ETag-style checksums arrive quoted and in either case.
pub fn normalize_checksum(raw: &str) -> String {
    raw.trim().trim_matches('"').to_ascii_lowercase()
}

pub fn qualified_key(bucket: &str, key: &str) -> String {
    format!("{bucket}/{key}")
}
