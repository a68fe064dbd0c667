use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Which input stream an ordering violation was observed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamSide {
    Catalog,
    Inventory,
}

impl StreamSide {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Catalog => "catalog",
            Self::Inventory => "inventory",
        }
    }
}

impl std::fmt::Display for StreamSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error)]
pub enum ReconError {
    #[error("transient i/o failure during {op}: {reason}")]
    TransientIo { op: String, reason: String },
    #[error("{stream} page did not arrive within {timeout_secs}s")]
    PageTimeout { stream: StreamSide, timeout_secs: u64 },
    #[error("catalog store unavailable after {attempts} attempt(s): {reason}")]
    CatalogUnavailable { attempts: u32, reason: String },
    #[error("catalog snapshot `{0}` does not exist")]
    InvalidSnapshot(String),
    #[error("inventory report `{0}` does not exist")]
    UnknownInventoryReport(String),
    #[error("catalog snapshot `{snapshot}` row at byte {offset} is malformed: {reason}")]
    CatalogRecordMalformed {
        snapshot: String,
        offset: u64,
        reason: String,
    },
    #[error("inventory report `{report}` is incomplete: {reason}")]
    InventoryReportIncomplete { report: String, reason: String },
    #[error("inventory report `{report}` part `{part}` line {line} is malformed: {reason}")]
    InventoryReportMalformed {
        report: String,
        part: String,
        line: u64,
        reason: String,
    },
    #[error("unsorted {stream} input: `{current}` follows `{previous}`")]
    UnsortedInputDetected {
        stream: StreamSide,
        previous: String,
        current: String,
    },
    #[error("duplicate key `{key}` in {stream} input")]
    DuplicateKey { stream: StreamSide, key: String },
    #[error("archive list `{list_id}` is locked by another run ({holder})")]
    ConcurrencyConflict { list_id: String, holder: String },
}

impl ReconError {
    pub fn transient(op: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::TransientIo {
            op: op.into(),
            reason: reason.to_string(),
        }
    }

    pub fn category(&self) -> FailureCategory {
        match self {
            Self::TransientIo { .. } | Self::PageTimeout { .. } | Self::CatalogUnavailable { .. } => {
                FailureCategory::TransientIo
            }
            Self::InvalidSnapshot(_) | Self::UnknownInventoryReport(_) => {
                FailureCategory::InvalidRequest
            }
            Self::CatalogRecordMalformed { .. }
            | Self::InventoryReportIncomplete { .. }
            | Self::InventoryReportMalformed { .. }
            | Self::UnsortedInputDetected { .. }
            | Self::DuplicateKey { .. } => FailureCategory::DataIntegrity,
            Self::ConcurrencyConflict { .. } => FailureCategory::ConcurrencyConflict,
        }
    }

    /// Only store-level transient failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientIo { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    TransientIo,
    DataIntegrity,
    ConcurrencyConflict,
    InvalidRequest,
}

impl FailureCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TransientIo => "transient_io",
            Self::DataIntegrity => "data_integrity",
            Self::ConcurrencyConflict => "concurrency_conflict",
            Self::InvalidRequest => "invalid_request",
        }
    }
}

impl std::fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
