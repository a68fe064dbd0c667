//! Sorted merge-join of the catalog and inventory streams.
//!
//! Both inputs must be strictly increasing by key (byte order). The merge
//! checks that continuously and stops at the first violation, so a bad
//! reader can never turn into quietly wrong classifications.

use crate::error::{ReconError, StreamSide};
use crate::recon::model::{
    ArchiveRecord, InventoryEntry, ReconciliationResult, ReconciliationStatus, normalize_checksum,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// One key after classification, with both sides kept for downstream consumers.
#[derive(Debug, Clone)]
pub struct Classified {
    pub key: String,
    pub status: ReconciliationStatus,
    pub catalog: Option<ArchiveRecord>,
    pub inventory: Option<InventoryEntry>,
    /// Orphan still inside the grace window: recorded, never alerted on.
    pub anomaly_suppressed: bool,
}

impl Classified {
    pub fn to_result(
        &self,
        run_id: &str,
        catalog_snapshot_id: &str,
        inventory_report_id: &str,
        detected_at: DateTime<Utc>,
    ) -> ReconciliationResult {
        ReconciliationResult {
            key: self.key.clone(),
            status: self.status,
            run_id: run_id.to_string(),
            catalog_snapshot_id: catalog_snapshot_id.to_string(),
            inventory_report_id: inventory_report_id.to_string(),
            detected_at,
            expected_storage_class: self
                .catalog
                .as_ref()
                .map(|c| c.expected_storage_class.clone()),
            observed_storage_class: self.inventory.as_ref().map(|i| i.storage_class.clone()),
            expected_checksum: self.catalog.as_ref().map(|c| c.expected_checksum.clone()),
            observed_checksum: self.inventory.as_ref().map(|i| i.checksum.clone()),
            anomaly_suppressed: self.anomaly_suppressed,
        }
    }
}

pub fn classify_pair(record: &ArchiveRecord, entry: &InventoryEntry) -> ReconciliationStatus {
    if record.expected_storage_class != entry.storage_class {
        ReconciliationStatus::StorageClassMismatch
    } else if normalize_checksum(&record.expected_checksum) != normalize_checksum(&entry.checksum)
    {
        ReconciliationStatus::ChecksumMismatch
    } else {
        ReconciliationStatus::Confirmed
    }
}

struct OrderGuard {
    stream: StreamSide,
    last: Option<String>,
}

impl OrderGuard {
    fn new(stream: StreamSide) -> Self {
        Self { stream, last: None }
    }

    fn admit(&mut self, key: &str) -> Result<(), ReconError> {
        if let Some(prev) = &self.last {
            match key.as_bytes().cmp(prev.as_bytes()) {
                Ordering::Greater => {}
                Ordering::Equal => {
                    return Err(ReconError::DuplicateKey {
                        stream: self.stream,
                        key: key.to_string(),
                    });
                }
                Ordering::Less => {
                    return Err(ReconError::UnsortedInputDetected {
                        stream: self.stream,
                        previous: prev.clone(),
                        current: key.to_string(),
                    });
                }
            }
        }
        self.last = Some(key.to_string());
        Ok(())
    }
}

/// Counters accumulated over one merge pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    pub catalog_rows: u64,
    pub inventory_rows: u64,
    pub suppressed_orphans: u64,
    pub counts_by_category: BTreeMap<ReconciliationStatus, u64>,
}

impl Tally {
    pub fn record(&mut self, item: &Classified) {
        if item.catalog.is_some() {
            self.catalog_rows += 1;
        }
        if item.inventory.is_some() {
            self.inventory_rows += 1;
        }
        if item.anomaly_suppressed {
            self.suppressed_orphans += 1;
        }
        *self.counts_by_category.entry(item.status).or_insert(0) += 1;
    }

    pub fn count(&self, status: ReconciliationStatus) -> u64 {
        self.counts_by_category.get(&status).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.counts_by_category.values().sum()
    }
}

pub struct MergeJoin<C, I>
where
    C: Iterator<Item = Result<ArchiveRecord, ReconError>>,
    I: Iterator<Item = Result<InventoryEntry, ReconError>>,
{
    catalog: C,
    inventory: I,
    catalog_head: Option<ArchiveRecord>,
    inventory_head: Option<InventoryEntry>,
    catalog_guard: OrderGuard,
    inventory_guard: OrderGuard,
    grace_cutoff: DateTime<Utc>,
    primed: bool,
    failed: bool,
}

impl<C, I> MergeJoin<C, I>
where
    C: Iterator<Item = Result<ArchiveRecord, ReconError>>,
    I: Iterator<Item = Result<InventoryEntry, ReconError>>,
{
    /// Orphans modified after `grace_cutoff` are marked suppressed.
    pub fn new(catalog: C, inventory: I, grace_cutoff: DateTime<Utc>) -> Self {
        Self {
            catalog,
            inventory,
            catalog_head: None,
            inventory_head: None,
            catalog_guard: OrderGuard::new(StreamSide::Catalog),
            inventory_guard: OrderGuard::new(StreamSide::Inventory),
            grace_cutoff,
            primed: false,
            failed: false,
        }
    }

    fn pull_catalog(&mut self) -> Result<(), ReconError> {
        self.catalog_head = match self.catalog.next() {
            Some(row) => {
                let row = row?;
                self.catalog_guard.admit(&row.key)?;
                Some(row)
            }
            None => None,
        };
        Ok(())
    }

    fn pull_inventory(&mut self) -> Result<(), ReconError> {
        self.inventory_head = match self.inventory.next() {
            Some(entry) => {
                let entry = entry?;
                self.inventory_guard.admit(&entry.key)?;
                Some(entry)
            }
            None => None,
        };
        Ok(())
    }

    fn orphan(&self, entry: InventoryEntry) -> Classified {
        Classified {
            key: entry.key.clone(),
            status: ReconciliationStatus::OrphanedInStorage,
            anomaly_suppressed: entry.last_modified > self.grace_cutoff,
            catalog: None,
            inventory: Some(entry),
        }
    }

    fn step(&mut self) -> Result<Option<Classified>, ReconError> {
        if !self.primed {
            self.pull_catalog()?;
            self.pull_inventory()?;
            self.primed = true;
        }

        let order = match (&self.catalog_head, &self.inventory_head) {
            (None, None) => return Ok(None),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (Some(c), Some(i)) => c.key.as_bytes().cmp(i.key.as_bytes()),
        };

        let out = match order {
            Ordering::Less => {
                let Some(record) = self.catalog_head.take() else {
                    return Ok(None);
                };
                self.pull_catalog()?;
                Classified {
                    key: record.key.clone(),
                    status: ReconciliationStatus::MissingFromStorage,
                    catalog: Some(record),
                    inventory: None,
                    anomaly_suppressed: false,
                }
            }
            Ordering::Greater => {
                let Some(entry) = self.inventory_head.take() else {
                    return Ok(None);
                };
                self.pull_inventory()?;
                self.orphan(entry)
            }
            Ordering::Equal => {
                let (Some(record), Some(entry)) =
                    (self.catalog_head.take(), self.inventory_head.take())
                else {
                    return Ok(None);
                };
                self.pull_catalog()?;
                self.pull_inventory()?;
                Classified {
                    key: record.key.clone(),
                    status: classify_pair(&record, &entry),
                    catalog: Some(record),
                    inventory: Some(entry),
                    anomaly_suppressed: false,
                }
            }
        };
        Ok(Some(out))
    }
}

impl<C, I> Iterator for MergeJoin<C, I>
where
    C: Iterator<Item = Result<ArchiveRecord, ReconError>>,
    I: Iterator<Item = Result<InventoryEntry, ReconError>>,
{
    type Item = Result<Classified, ReconError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.step() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => None,
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recon::catalog::tests::record;
    use chrono::Duration;

    fn ts(raw: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(raw)
            .expect("ts")
            .with_timezone(&Utc)
    }

    fn entry(key: &str, class: &str, checksum: &str, modified: &str) -> InventoryEntry {
        InventoryEntry {
            key: key.to_string(),
            storage_class: class.to_string(),
            checksum: checksum.to_string(),
            size: 1,
            last_modified: ts(modified),
            report_generated_at: ts("2026-02-01T00:00:00Z"),
        }
    }

    fn run(
        catalog: Vec<ArchiveRecord>,
        inventory: Vec<InventoryEntry>,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Classified>, ReconError> {
        MergeJoin::new(
            catalog.into_iter().map(Ok),
            inventory.into_iter().map(Ok),
            cutoff,
        )
        .collect()
    }

    fn statuses(items: &[Classified]) -> Vec<(String, ReconciliationStatus)> {
        items.iter().map(|c| (c.key.clone(), c.status)).collect()
    }

    #[test]
    fn three_way_classification() {
        let catalog = vec![
            record("a", "DEEP_ARCHIVE", "11"),
            record("b", "DEEP_ARCHIVE", "22"),
            record("c", "DEEP_ARCHIVE", "33"),
        ];
        let inventory = vec![
            entry("b", "DEEP_ARCHIVE", "22", "2026-01-01T00:00:00Z"),
            entry("c", "DEEP_ARCHIVE", "99", "2026-01-01T00:00:00Z"),
            entry("d", "DEEP_ARCHIVE", "44", "2026-01-01T00:00:00Z"),
        ];
        let out = run(catalog, inventory, ts("2026-01-30T00:00:00Z")).expect("merge");
        assert_eq!(
            statuses(&out),
            vec![
                ("a".to_string(), ReconciliationStatus::MissingFromStorage),
                ("b".to_string(), ReconciliationStatus::Confirmed),
                ("c".to_string(), ReconciliationStatus::ChecksumMismatch),
                ("d".to_string(), ReconciliationStatus::OrphanedInStorage),
            ]
        );
        assert!(!out[3].anomaly_suppressed);
    }

    #[test]
    fn storage_class_is_checked_before_checksum() {
        let out = run(
            vec![record("k", "DEEP_ARCHIVE", "11")],
            vec![entry("k", "STANDARD", "22", "2026-01-01T00:00:00Z")],
            ts("2026-01-30T00:00:00Z"),
        )
        .expect("merge");
        assert_eq!(out[0].status, ReconciliationStatus::StorageClassMismatch);
    }

    #[test]
    fn keys_differing_only_in_case_stay_distinct() {
        let out = run(
            vec![record("B/x", "GLACIER", "1")],
            vec![entry("b/x", "GLACIER", "1", "2026-01-01T00:00:00Z")],
            ts("2026-01-30T00:00:00Z"),
        )
        .expect("merge");
        assert_eq!(
            statuses(&out),
            vec![
                ("B/x".to_string(), ReconciliationStatus::MissingFromStorage),
                ("b/x".to_string(), ReconciliationStatus::OrphanedInStorage),
            ]
        );
    }

    #[test]
    fn recent_orphans_are_suppressed_not_dropped() {
        let now = ts("2026-02-01T00:00:00Z");
        let cutoff = now - Duration::hours(24);
        let out = run(
            vec![],
            vec![
                entry("new", "GLACIER", "1", "2026-01-31T12:00:00Z"),
                entry("old", "GLACIER", "1", "2026-01-20T00:00:00Z"),
            ],
            cutoff,
        )
        .expect("merge");
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|c| c.status == ReconciliationStatus::OrphanedInStorage));
        assert!(out[0].anomaly_suppressed);
        assert!(!out[1].anomaly_suppressed);
    }

    #[test]
    fn unsorted_catalog_fails_fast() {
        let mut merge = MergeJoin::new(
            vec![record("b", "GLACIER", "1"), record("a", "GLACIER", "1")]
                .into_iter()
                .map(Ok),
            Vec::<InventoryEntry>::new().into_iter().map(Ok),
            ts("2026-01-30T00:00:00Z"),
        );
        let first = merge.next().expect("item");
        assert!(matches!(
            first,
            Err(ReconError::UnsortedInputDetected {
                stream: StreamSide::Catalog,
                ..
            })
        ));
        assert!(merge.next().is_none());
    }

    #[test]
    fn duplicate_inventory_key_is_rejected() {
        let err = run(
            vec![],
            vec![
                entry("a", "GLACIER", "1", "2026-01-01T00:00:00Z"),
                entry("a", "GLACIER", "1", "2026-01-01T00:00:00Z"),
            ],
            ts("2026-01-30T00:00:00Z"),
        )
        .expect_err("duplicate");
        assert!(matches!(
            err,
            ReconError::DuplicateKey {
                stream: StreamSide::Inventory,
                ..
            }
        ));
    }

    #[test]
    fn identical_inputs_classify_identically() {
        let catalog = vec![record("a", "GLACIER", "1"), record("c", "GLACIER", "3")];
        let inventory = vec![
            entry("a", "GLACIER", "1", "2026-01-01T00:00:00Z"),
            entry("b", "GLACIER", "2", "2026-01-01T00:00:00Z"),
        ];
        let cutoff = ts("2026-01-30T00:00:00Z");
        let first = run(catalog.clone(), inventory.clone(), cutoff).expect("first");
        let second = run(catalog, inventory, cutoff).expect("second");
        assert_eq!(statuses(&first), statuses(&second));
    }

    #[test]
    fn tally_counts_each_category() {
        let out = run(
            vec![record("a", "GLACIER", "1"), record("b", "GLACIER", "2")],
            vec![
                entry("b", "GLACIER", "2", "2026-01-01T00:00:00Z"),
                entry("c", "GLACIER", "3", "2026-01-01T00:00:00Z"),
            ],
            ts("2026-01-30T00:00:00Z"),
        )
        .expect("merge");
        let mut tally = Tally::default();
        for item in &out {
            tally.record(item);
        }
        assert_eq!(tally.count(ReconciliationStatus::Confirmed), 1);
        assert_eq!(tally.count(ReconciliationStatus::MissingFromStorage), 1);
        assert_eq!(tally.count(ReconciliationStatus::OrphanedInStorage), 1);
        assert_eq!(tally.catalog_rows, 2);
        assert_eq!(tally.inventory_rows, 2);
        assert_eq!(tally.total(), 3);
    }
}
