//! Anomaly lifecycle per archive list.
//!
//! The store is a single JSON document mapping key to its latest anomaly
//! record. A run observes every classified key, stages transitions in
//! memory, and only touches disk in [`AnomalyReporter::commit`].

use crate::recon::model::ReconciliationStatus;
use crate::recon::notify;
use crate::recon::paths::LedgerPaths;
use crate::recon::reconciler::Classified;
use crate::recon::util::{persist_staged, stage_bytes};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use tempfile::NamedTempFile;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// The key came back CONFIRMED.
    Confirmed,
    /// A different anomaly status replaced this one.
    Superseded,
    /// The key is gone from both catalog and inventory.
    Absent,
}

impl Resolution {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Confirmed => "confirmed",
            Self::Superseded => "superseded",
            Self::Absent => "absent",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AnomalyState {
    Open,
    Closed {
        closed_at: DateTime<Utc>,
        closed_in_run: String,
        resolution: Resolution,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnomalyRecord {
    pub key: String,
    pub status: ReconciliationStatus,
    #[serde(flatten)]
    pub state: AnomalyState,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub first_run_id: String,
    pub last_run_id: String,
    pub catalog_snapshot_id: String,
    pub inventory_report_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_storage_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_storage_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_checksum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_checksum: Option<String>,
    pub remediation: String,
}

impl AnomalyRecord {
    pub fn is_open(&self) -> bool {
        matches!(self.state, AnomalyState::Open)
    }
}

pub fn remediation_hint(status: ReconciliationStatus) -> &'static str {
    match status {
        ReconciliationStatus::Confirmed => "none",
        ReconciliationStatus::MissingFromStorage => {
            "re-run the archive copy for this key and confirm the object lands in the bucket"
        }
        ReconciliationStatus::OrphanedInStorage => {
            "register the object in the catalog or remove it from the archive bucket"
        }
        ReconciliationStatus::StorageClassMismatch => {
            "transition the object to the expected storage class or fix the catalog entry"
        }
        ReconciliationStatus::ChecksumMismatch => {
            "re-archive the object from its source and verify the checksum"
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnomalyStore {
    pub list_id: String,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_run_id: Option<String>,
    #[serde(default)]
    pub records: BTreeMap<String, AnomalyRecord>,
}

impl AnomalyStore {
    pub fn load(paths: &LedgerPaths, list_id: &str) -> Result<Self> {
        let path = paths.anomaly_store_file(list_id);
        if !path.exists() {
            return Ok(Self {
                list_id: list_id.to_string(),
                ..Self::default()
            });
        }
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
    }

    pub fn open(&self) -> impl Iterator<Item = &AnomalyRecord> {
        self.records.values().filter(|r| r.is_open())
    }

    pub fn open_count(&self) -> usize {
        self.open().count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    Opened,
    Refreshed,
    Reopened,
    Closed,
}

impl Transition {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Opened => "opened",
            Self::Refreshed => "refreshed",
            Self::Reopened => "reopened",
            Self::Closed => "closed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnomalyEvent {
    pub at: DateTime<Utc>,
    pub list_id: String,
    pub run_id: String,
    pub key: String,
    pub transition: Transition,
    pub status: ReconciliationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_status: Option<ReconciliationStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Resolution>,
    pub remediation: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionCounts {
    pub opened: u64,
    pub refreshed: u64,
    pub reopened: u64,
    pub closed: u64,
}

pub struct AnomalyReporter {
    store: AnomalyStore,
    run_id: String,
    catalog_snapshot_id: String,
    inventory_report_id: String,
    now: DateTime<Utc>,
    seen: HashSet<String>,
    events: Vec<AnomalyEvent>,
}

impl AnomalyReporter {
    pub fn new(
        store: AnomalyStore,
        run_id: &str,
        catalog_snapshot_id: &str,
        inventory_report_id: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            store,
            run_id: run_id.to_string(),
            catalog_snapshot_id: catalog_snapshot_id.to_string(),
            inventory_report_id: inventory_report_id.to_string(),
            now,
            seen: HashSet::new(),
            events: Vec::new(),
        }
    }

    fn event(
        &self,
        key: &str,
        transition: Transition,
        status: ReconciliationStatus,
        previous_status: Option<ReconciliationStatus>,
        resolution: Option<Resolution>,
    ) -> AnomalyEvent {
        AnomalyEvent {
            at: self.now,
            list_id: self.store.list_id.clone(),
            run_id: self.run_id.clone(),
            key: key.to_string(),
            transition,
            status,
            previous_status,
            resolution,
            remediation: remediation_hint(status).to_string(),
        }
    }

    fn close(&mut self, key: &str, resolution: Resolution) {
        let Some(record) = self.store.records.get_mut(key) else {
            return;
        };
        record.state = AnomalyState::Closed {
            closed_at: self.now,
            closed_in_run: self.run_id.clone(),
            resolution,
        };
        let status = record.status;
        let event = self.event(key, Transition::Closed, status, None, Some(resolution));
        self.events.push(event);
    }

    fn open(&mut self, item: &Classified, transition: Transition, previous: Option<ReconciliationStatus>) {
        let record = AnomalyRecord {
            key: item.key.clone(),
            status: item.status,
            state: AnomalyState::Open,
            first_seen_at: self.now,
            last_seen_at: self.now,
            first_run_id: self.run_id.clone(),
            last_run_id: self.run_id.clone(),
            catalog_snapshot_id: self.catalog_snapshot_id.clone(),
            inventory_report_id: self.inventory_report_id.clone(),
            expected_storage_class: item
                .catalog
                .as_ref()
                .map(|c| c.expected_storage_class.clone()),
            observed_storage_class: item.inventory.as_ref().map(|i| i.storage_class.clone()),
            expected_checksum: item.catalog.as_ref().map(|c| c.expected_checksum.clone()),
            observed_checksum: item.inventory.as_ref().map(|i| i.checksum.clone()),
            remediation: remediation_hint(item.status).to_string(),
        };
        self.store.records.insert(item.key.clone(), record);
        let event = self.event(&item.key, transition, item.status, previous, None);
        self.events.push(event);
    }

    fn refresh(&mut self, key: &str) {
        let Some(record) = self.store.records.get_mut(key) else {
            return;
        };
        record.last_seen_at = self.now;
        record.last_run_id = self.run_id.clone();
        record.catalog_snapshot_id = self.catalog_snapshot_id.clone();
        record.inventory_report_id = self.inventory_report_id.clone();
        let status = record.status;
        let event = self.event(key, Transition::Refreshed, status, None, None);
        self.events.push(event);
    }

    pub fn observe(&mut self, item: &Classified) {
        let current = self
            .store
            .records
            .get(&item.key)
            .map(|r| (r.is_open(), r.status));
        if current.is_some() {
            self.seen.insert(item.key.clone());
        }
        let open_status = match current {
            Some((true, status)) => Some(status),
            _ => None,
        };

        match (item.status.is_anomaly(), open_status) {
            (false, Some(_)) => self.close(&item.key, Resolution::Confirmed),
            (false, None) => {}
            (true, Some(status)) if status == item.status => self.refresh(&item.key),
            (true, Some(status)) => {
                self.close(&item.key, Resolution::Superseded);
                if !item.anomaly_suppressed {
                    self.open(item, Transition::Reopened, Some(status));
                }
            }
            (true, None) if item.anomaly_suppressed => {}
            (true, None) => self.open(item, Transition::Opened, None),
        }
    }

    /// Close anomalies whose key appeared in neither stream this run.
    pub fn finish(&mut self) {
        let absent: Vec<String> = self
            .store
            .records
            .values()
            .filter(|r| r.is_open() && !self.seen.contains(&r.key))
            .map(|r| r.key.clone())
            .collect();
        for key in absent {
            self.close(&key, Resolution::Absent);
        }
    }

    pub fn counts(&self) -> TransitionCounts {
        let mut counts = TransitionCounts::default();
        for event in &self.events {
            match event.transition {
                Transition::Opened => counts.opened += 1,
                Transition::Refreshed => counts.refreshed += 1,
                Transition::Reopened => counts.reopened += 1,
                Transition::Closed => counts.closed += 1,
            }
        }
        counts
    }

    /// Persist the store, append the event log and emit alert lines.
    /// Write the new store and the extended event log to synced staging
    /// files. Nothing live changes until [`StagedAnomalies::publish`].
    pub fn stage(mut self, paths: &LedgerPaths) -> Result<StagedAnomalies> {
        let counts = self.counts();
        self.store.updated_at = Some(self.now);
        self.store.last_run_id = Some(self.run_id.clone());

        let store_path = paths.anomaly_store_file(&self.store.list_id);
        let data = serde_json::to_string_pretty(&self.store)?;
        let store = stage_bytes(&store_path, format!("{data}\n").as_bytes())?;

        let event_log = if self.events.is_empty() {
            None
        } else {
            let path = paths.anomaly_events_file(&self.store.list_id);
            let mut buf = match fs::read(&path) {
                Ok(existing) => existing,
                Err(err) if err.kind() == ErrorKind::NotFound => Vec::new(),
                Err(err) => {
                    return Err(err).with_context(|| format!("failed to read {}", path.display()));
                }
            };
            if !buf.is_empty() && !buf.ends_with(b"\n") {
                buf.push(b'\n');
            }
            for event in &self.events {
                serde_json::to_writer(&mut buf, event)?;
                buf.push(b'\n');
            }
            Some((stage_bytes(&path, &buf)?, path))
        };

        Ok(StagedAnomalies {
            store,
            store_path,
            event_log,
            events: self.events,
            counts,
        })
    }

    pub fn commit(self, paths: &LedgerPaths) -> Result<TransitionCounts> {
        self.stage(paths)?.publish()
    }
}

/// Anomaly state written and synced, waiting on its renames.
pub struct StagedAnomalies {
    store: NamedTempFile,
    store_path: PathBuf,
    event_log: Option<(NamedTempFile, PathBuf)>,
    events: Vec<AnomalyEvent>,
    counts: TransitionCounts,
}

impl StagedAnomalies {
    pub fn counts(&self) -> TransitionCounts {
        self.counts
    }

    /// Rename the staged files into place, then emit the anomaly lines.
    pub fn publish(self) -> Result<TransitionCounts> {
        persist_staged(self.store, &self.store_path)?;
        if let Some((staged, path)) = self.event_log {
            persist_staged(staged, &path)?;
        }
        for event in &self.events {
            if event.transition != Transition::Refreshed {
                notify::emit_anomaly(event);
            }
        }
        Ok(self.counts)
    }
}

pub fn read_events(paths: &LedgerPaths, list_id: &str) -> Result<Vec<AnomalyEvent>> {
    let path = paths.anomaly_events_file(list_id);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw =
        fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))?;
    raw.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str(line)
                .with_context(|| format!("bad anomaly event in {}", path.display()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recon::catalog::tests::record;
    use crate::recon::model::InventoryEntry;
    use tempfile::tempdir;

    fn at(hour: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_770_000_000 + hour * 3600, 0).expect("ts")
    }

    fn missing(key: &str) -> Classified {
        Classified {
            key: key.to_string(),
            status: ReconciliationStatus::MissingFromStorage,
            catalog: Some(record(key, "GLACIER", "1")),
            inventory: None,
            anomaly_suppressed: false,
        }
    }

    fn confirmed(key: &str) -> Classified {
        Classified {
            status: ReconciliationStatus::Confirmed,
            inventory: Some(observed(key)),
            ..missing(key)
        }
    }

    fn observed(key: &str) -> InventoryEntry {
        InventoryEntry {
            key: key.to_string(),
            storage_class: "GLACIER".to_string(),
            checksum: "1".to_string(),
            size: 1,
            last_modified: at(0),
            report_generated_at: at(0),
        }
    }

    fn orphan(key: &str, suppressed: bool) -> Classified {
        Classified {
            key: key.to_string(),
            status: ReconciliationStatus::OrphanedInStorage,
            catalog: None,
            inventory: Some(observed(key)),
            anomaly_suppressed: suppressed,
        }
    }

    fn run(paths: &LedgerPaths, run_id: &str, hour: i64, items: &[Classified]) -> TransitionCounts {
        let store = AnomalyStore::load(paths, "default").expect("load");
        let mut reporter = AnomalyReporter::new(store, run_id, "snap", "report", at(hour));
        for item in items {
            reporter.observe(item);
        }
        reporter.finish();
        reporter.commit(paths).expect("commit")
    }

    #[test]
    fn missing_then_confirmed_closes_anomaly() {
        let tmp = tempdir().expect("tempdir");
        let paths = LedgerPaths::under(tmp.path());

        let first = run(&paths, "run-1", 0, &[missing("b/k")]);
        assert_eq!(first.opened, 1);
        let store = AnomalyStore::load(&paths, "default").expect("load");
        assert_eq!(store.open_count(), 1);

        let second = run(&paths, "run-2", 1, &[confirmed("b/k")]);
        assert_eq!(second.closed, 1);
        let store = AnomalyStore::load(&paths, "default").expect("load");
        let record = &store.records["b/k"];
        assert_eq!(
            record.state,
            AnomalyState::Closed {
                closed_at: at(1),
                closed_in_run: "run-2".to_string(),
                resolution: Resolution::Confirmed,
            }
        );

        let events = read_events(&paths, "default").expect("events");
        let transitions: Vec<Transition> = events.iter().map(|e| e.transition).collect();
        assert_eq!(transitions, vec![Transition::Opened, Transition::Closed]);
    }

    #[test]
    fn repeat_sighting_bumps_last_seen_only() {
        let tmp = tempdir().expect("tempdir");
        let paths = LedgerPaths::under(tmp.path());
        run(&paths, "run-1", 0, &[missing("b/k")]);
        let counts = run(&paths, "run-2", 5, &[missing("b/k")]);
        assert_eq!(counts.refreshed, 1);
        assert_eq!(counts.opened, 0);

        let store = AnomalyStore::load(&paths, "default").expect("load");
        let record = &store.records["b/k"];
        assert_eq!(record.first_seen_at, at(0));
        assert_eq!(record.last_seen_at, at(5));
        assert_eq!(record.first_run_id, "run-1");
        assert_eq!(record.last_run_id, "run-2");
    }

    #[test]
    fn status_change_replaces_open_anomaly() {
        let tmp = tempdir().expect("tempdir");
        let paths = LedgerPaths::under(tmp.path());
        run(&paths, "run-1", 0, &[missing("b/k")]);
        let counts = run(&paths, "run-2", 1, &[orphan("b/k", false)]);
        assert_eq!(counts.closed, 1);
        assert_eq!(counts.reopened, 1);

        let store = AnomalyStore::load(&paths, "default").expect("load");
        let record = &store.records["b/k"];
        assert!(record.is_open());
        assert_eq!(record.status, ReconciliationStatus::OrphanedInStorage);
        assert_eq!(record.first_run_id, "run-2");
    }

    #[test]
    fn suppressed_orphan_opens_nothing() {
        let tmp = tempdir().expect("tempdir");
        let paths = LedgerPaths::under(tmp.path());
        let counts = run(&paths, "run-1", 0, &[orphan("b/new", true)]);
        assert_eq!(counts, TransitionCounts::default());
        let store = AnomalyStore::load(&paths, "default").expect("load");
        assert!(store.records.is_empty());
    }

    #[test]
    fn suppressed_orphan_refreshes_existing_anomaly() {
        let tmp = tempdir().expect("tempdir");
        let paths = LedgerPaths::under(tmp.path());
        run(&paths, "run-1", 0, &[orphan("b/o", false)]);
        let counts = run(&paths, "run-2", 1, &[orphan("b/o", true)]);
        assert_eq!(counts.refreshed, 1);
        assert!(AnomalyStore::load(&paths, "default").expect("load").records["b/o"].is_open());
    }

    #[test]
    fn suppressed_orphan_closes_other_status_without_opening() {
        let tmp = tempdir().expect("tempdir");
        let paths = LedgerPaths::under(tmp.path());
        run(&paths, "run-1", 0, &[missing("b/k")]);
        let counts = run(&paths, "run-2", 1, &[orphan("b/k", true)]);
        assert_eq!(counts.closed, 1);
        assert_eq!(counts.opened + counts.reopened, 0);

        let store = AnomalyStore::load(&paths, "default").expect("load");
        let record = &store.records["b/k"];
        assert_eq!(record.status, ReconciliationStatus::MissingFromStorage);
        assert!(matches!(
            record.state,
            AnomalyState::Closed {
                resolution: Resolution::Superseded,
                ..
            }
        ));
        assert_eq!(store.open_count(), 0);
        let transitions: Vec<Transition> = read_events(&paths, "default")
            .expect("events")
            .iter()
            .map(|e| e.transition)
            .collect();
        assert_eq!(transitions, vec![Transition::Opened, Transition::Closed]);
    }

    #[test]
    fn vanished_key_closes_as_absent_and_can_reopen() {
        let tmp = tempdir().expect("tempdir");
        let paths = LedgerPaths::under(tmp.path());
        run(&paths, "run-1", 0, &[missing("b/k")]);
        let counts = run(&paths, "run-2", 1, &[]);
        assert_eq!(counts.closed, 1);
        let store = AnomalyStore::load(&paths, "default").expect("load");
        assert!(matches!(
            store.records["b/k"].state,
            AnomalyState::Closed {
                resolution: Resolution::Absent,
                ..
            }
        ));

        let counts = run(&paths, "run-3", 2, &[missing("b/k")]);
        assert_eq!(counts.opened, 1);
        assert!(AnomalyStore::load(&paths, "default").expect("load").records["b/k"].is_open());
    }

    #[test]
    fn uncommitted_reporter_leaves_store_untouched() {
        let tmp = tempdir().expect("tempdir");
        let paths = LedgerPaths::under(tmp.path());
        run(&paths, "run-1", 0, &[missing("b/k")]);

        let store = AnomalyStore::load(&paths, "default").expect("load");
        let mut reporter = AnomalyReporter::new(store, "run-2", "snap", "report", at(1));
        reporter.observe(&confirmed("b/k"));
        drop(reporter);

        assert!(AnomalyStore::load(&paths, "default").expect("load").records["b/k"].is_open());
    }

    #[test]
    fn staged_anomalies_change_nothing_until_published() {
        let tmp = tempdir().expect("tempdir");
        let paths = LedgerPaths::under(tmp.path());
        run(&paths, "run-1", 0, &[missing("b/k")]);
        let events_before = fs::read(paths.anomaly_events_file("default")).expect("events");

        let store = AnomalyStore::load(&paths, "default").expect("load");
        let mut reporter = AnomalyReporter::new(store, "run-2", "snap", "report", at(1));
        reporter.observe(&confirmed("b/k"));
        reporter.finish();
        let staged = reporter.stage(&paths).expect("stage");
        assert_eq!(staged.counts().closed, 1);
        assert!(AnomalyStore::load(&paths, "default").expect("load").records["b/k"].is_open());
        assert_eq!(
            fs::read(paths.anomaly_events_file("default")).expect("events"),
            events_before
        );

        staged.publish().expect("publish");
        assert_eq!(AnomalyStore::load(&paths, "default").expect("load").open_count(), 0);
        assert_eq!(read_events(&paths, "default").expect("events").len(), 2);
    }
}
