//! One reconciliation run, end to end.
//!
//! lock → journal PENDING/RUNNING → pipelined readers → merge → stage list,
//! results and anomalies → STAGED → swap list pointer → rename anomalies →
//! SUCCEEDED. Any error before the swap leaves every piece of live state as
//! it was and records the run as FAILED. After the swap the run succeeds.

use crate::error::{FailureCategory, ReconError, StreamSide};
use crate::recon::anomaly::{AnomalyReporter, AnomalyStore, TransitionCounts};
use crate::recon::archive_list::{ArchiveListBuilder, ListEntry, prune_generations, sweep_staging};
use crate::recon::audit;
use crate::recon::catalog::{CatalogReader, CatalogStore, FsCatalogStore, SnapshotRef};
use crate::recon::config::{LedgerConfig, MAX_GRACE_PERIOD};
use crate::recon::inventory::{FsInventoryStore, InventoryReader, InventoryStore};
use crate::recon::journal::{self, RunRecord, RunStatus};
use crate::recon::lock::RunLock;
use crate::recon::model::{ReconciliationStatus, normalize_checksum};
use crate::recon::paths::LedgerPaths;
use crate::recon::prefetch;
use crate::recon::reconciler::{MergeJoin, Tally};
use crate::recon::results::ResultLog;
use crate::recon::retry::RetryPolicy;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub list_id: String,
    pub catalog: SnapshotRef,
    pub inventory_report_id: String,
    /// Orphans modified within this long before `as_of` raise no anomaly.
    pub grace_period: std::time::Duration,
    /// Reference time for the grace window and `detected_at`.
    pub as_of: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub list_id: String,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_category: Option<FailureCategory>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub catalog_snapshot_id: Option<String>,
    pub inventory_report_id: String,
    pub counts_by_category: BTreeMap<ReconciliationStatus, u64>,
    pub suppressed_orphans: u64,
    pub catalog_rows: u64,
    pub inventory_rows: u64,
    pub anomalies: TransitionCounts,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive_list_entries: Option<u64>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunSummary {
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    pub fn count(&self, status: ReconciliationStatus) -> u64 {
        self.counts_by_category.get(&status).copied().unwrap_or(0)
    }
}

/// What a completed merge hands to the commit step.
struct Outcome {
    tally: Tally,
    anomalies: TransitionCounts,
    list_entries: u64,
}

fn local_state(op: &'static str) -> impl FnOnce(anyhow::Error) -> ReconError {
    move |err| ReconError::transient(op, format!("{err:#}"))
}

pub struct ReconcileEngine {
    paths: LedgerPaths,
    config: LedgerConfig,
    catalog: Arc<dyn CatalogStore>,
    inventory: Arc<dyn InventoryStore>,
}

impl ReconcileEngine {
    pub fn new(
        paths: LedgerPaths,
        config: LedgerConfig,
        catalog: Arc<dyn CatalogStore>,
        inventory: Arc<dyn InventoryStore>,
    ) -> Self {
        Self {
            paths,
            config,
            catalog,
            inventory,
        }
    }

    /// Engine over the filesystem catalog exports and inventory reports.
    pub fn from_paths(paths: LedgerPaths, config: LedgerConfig) -> Self {
        let catalog = Arc::new(FsCatalogStore::new(paths.catalog_dir.clone()));
        let inventory = Arc::new(FsInventoryStore::new(paths.inventory_dir.clone()));
        Self::new(paths, config, catalog, inventory)
    }

    pub fn paths(&self) -> &LedgerPaths {
        &self.paths
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Reconcile against the configured default list, as of now.
    pub fn reconcile(
        &self,
        catalog: &SnapshotRef,
        inventory_report_id: &str,
        grace_period: std::time::Duration,
    ) -> RunSummary {
        self.run(&RunRequest {
            list_id: self.config.reconcile.default_list_id.clone(),
            catalog: catalog.clone(),
            inventory_report_id: inventory_report_id.to_string(),
            grace_period,
            as_of: Utc::now(),
        })
    }

    pub fn run(&self, request: &RunRequest) -> RunSummary {
        let run_id = uuid::Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let mut record = RunRecord::new(
            &run_id,
            &request.list_id,
            &request.catalog.to_string(),
            &request.inventory_report_id,
            request.grace_period.min(MAX_GRACE_PERIOD).as_secs(),
            started_at,
        );

        let _lock = match RunLock::acquire(&self.paths, &request.list_id, &run_id, started_at) {
            Ok(lock) => lock,
            Err(err) => {
                tracing::warn!(list_id = %request.list_id, error = %err, "run refused");
                return self.failed_summary(&record, &err, None);
            }
        };

        let mut tally = Tally::default();
        let result = self
            .begin(&mut record)
            .and_then(|()| self.execute(request, &mut record, &mut tally));

        match result {
            Ok(outcome) => {
                if let Err(err) = record.advance(RunStatus::Succeeded, Utc::now()) {
                    tracing::warn!(run_id = %run_id, error = %err, "journal transition rejected");
                }
                self.persist_record(&record);
                audit::record(
                    &self.paths,
                    &run_id,
                    &request.list_id,
                    "finish",
                    "ok",
                    &format!(
                        "confirmed={} anomalies_opened={} list_entries={}",
                        outcome.tally.count(ReconciliationStatus::Confirmed),
                        outcome.anomalies.opened + outcome.anomalies.reopened,
                        outcome.list_entries
                    ),
                );
                tracing::info!(
                    run_id = %run_id,
                    list_id = %request.list_id,
                    keys = outcome.tally.total(),
                    confirmed = outcome.tally.count(ReconciliationStatus::Confirmed),
                    suppressed_orphans = outcome.tally.suppressed_orphans,
                    "reconciliation succeeded"
                );
                self.summary(&record, &outcome.tally, outcome.anomalies, Some(outcome.list_entries))
            }
            Err(err) => {
                if !record.status.is_terminal() {
                    if let Err(journal_err) = record.fail(err.category(), err.to_string(), Utc::now()) {
                        tracing::warn!(run_id = %run_id, error = %journal_err, "journal transition rejected");
                    }
                }
                self.persist_record(&record);
                audit::record(
                    &self.paths,
                    &run_id,
                    &request.list_id,
                    "finish",
                    err.category().as_str(),
                    &err.to_string(),
                );
                tracing::error!(
                    run_id = %run_id,
                    list_id = %request.list_id,
                    category = %err.category(),
                    error = %err,
                    "reconciliation failed"
                );
                self.failed_summary(&record, &err, Some(&tally))
            }
        }
    }

    fn begin(&self, record: &mut RunRecord) -> Result<(), ReconError> {
        journal::save(&self.paths, record).map_err(local_state("write run record"))?;
        audit::record(
            &self.paths,
            &record.run_id,
            &record.list_id,
            "start",
            "ok",
            &format!(
                "catalog={} inventory={} grace_secs={}",
                record.catalog_snapshot, record.inventory_report_id, record.grace_period_secs
            ),
        );
        record
            .advance(RunStatus::Running, Utc::now())
            .map_err(local_state("advance run record"))?;
        journal::save(&self.paths, record).map_err(local_state("write run record"))?;
        Ok(())
    }

    fn execute(
        &self,
        request: &RunRequest,
        record: &mut RunRecord,
        tally: &mut Tally,
    ) -> Result<Outcome, ReconError> {
        let retry = RetryPolicy::from_config(&self.config.retry);
        let page_size = self.config.fetch.page_size;
        let depth = self.config.fetch.prefetch_pages;
        let timeout = self.config.page_timeout();

        let catalog =
            CatalogReader::open(Arc::clone(&self.catalog), &request.catalog, page_size, retry)?;
        let snapshot_id = catalog.snapshot_id().to_string();
        record.catalog_snapshot_id = Some(snapshot_id.clone());
        let inventory = InventoryReader::open(
            Arc::clone(&self.inventory),
            &request.inventory_report_id,
            page_size,
            retry,
        )?;
        tracing::info!(
            run_id = %record.run_id,
            snapshot = %snapshot_id,
            report = %request.inventory_report_id,
            "inputs resolved, starting merge"
        );

        let grace =
            Duration::milliseconds(request.grace_period.min(MAX_GRACE_PERIOD).as_millis() as i64);
        let cutoff = request
            .as_of
            .checked_sub_signed(grace)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let list_dir = self.paths.archive_list_dir(&request.list_id);
        match sweep_staging(&list_dir) {
            Ok(stale) if !stale.is_empty() => {
                tracing::info!(list_id = %request.list_id, removed = stale.len(), "removed stale staging files");
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(list_id = %request.list_id, error = %format!("{err:#}"), "staging sweep failed");
            }
        }
        let mut builder =
            ArchiveListBuilder::begin(&list_dir, &request.list_id, &record.run_id, record.started_at)
                .map_err(local_state("stage archive list"))?;
        let mut results =
            ResultLog::create(&self.paths, &record.run_id).map_err(local_state("stage results"))?;
        let store = AnomalyStore::load(&self.paths, &request.list_id)
            .map_err(local_state("load anomaly store"))?;
        let mut reporter = AnomalyReporter::new(
            store,
            &record.run_id,
            &snapshot_id,
            &request.inventory_report_id,
            request.as_of,
        );

        let catalog_rows = prefetch::spawn(StreamSide::Catalog, catalog, depth, timeout)?;
        let inventory_rows = prefetch::spawn(StreamSide::Inventory, inventory, depth, timeout)?;

        for item in MergeJoin::new(catalog_rows, inventory_rows, cutoff) {
            let item = item?;
            tally.record(&item);
            results
                .append(&item.to_result(
                    &record.run_id,
                    &snapshot_id,
                    &request.inventory_report_id,
                    request.as_of,
                ))
                .map_err(local_state("stage results"))?;
            if let (ReconciliationStatus::Confirmed, Some(observed)) = (item.status, &item.inventory) {
                builder
                    .stage(&ListEntry {
                        key: observed.key.clone(),
                        storage_class: observed.storage_class.clone(),
                        checksum: normalize_checksum(&observed.checksum),
                        size: observed.size,
                        last_modified: observed.last_modified,
                    })
                    .map_err(local_state("stage archive list"))?;
            }
            reporter.observe(&item);
        }
        reporter.finish();

        let staged = builder
            .finish(Utc::now())
            .map_err(local_state("stage archive list"))?;
        results.seal().map_err(local_state("write results"))?;
        let anomalies = reporter
            .stage(&self.paths)
            .map_err(local_state("stage anomaly store"))?;
        record.counts_by_category = tally.counts_by_category.clone();
        record.suppressed_orphans = tally.suppressed_orphans;
        record
            .advance(RunStatus::Staged, Utc::now())
            .map_err(local_state("advance run record"))?;
        journal::save(&self.paths, record).map_err(local_state("write run record"))?;

        let pointer = staged.commit().map_err(local_state("swap archive list"))?;
        // The new list is live from here on, so nothing below fails the run.
        let anomalies = match anomalies.publish() {
            Ok(counts) => counts,
            Err(err) => {
                let err = format!("{err:#}");
                tracing::error!(
                    run_id = %record.run_id,
                    list_id = %request.list_id,
                    error = %err,
                    "anomaly store not updated"
                );
                audit::record(
                    &self.paths,
                    &record.run_id,
                    &request.list_id,
                    "anomalies",
                    FailureCategory::TransientIo.as_str(),
                    &err,
                );
                TransitionCounts::default()
            }
        };

        match prune_generations(&list_dir, self.config.retention.keep_generations) {
            Ok(removed) if !removed.is_empty() => {
                tracing::debug!(list_id = %request.list_id, removed = removed.len(), "pruned old generations");
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(list_id = %request.list_id, error = %format!("{err:#}"), "generation prune failed");
            }
        }

        Ok(Outcome {
            tally: tally.clone(),
            anomalies,
            list_entries: pointer.entry_count,
        })
    }

    fn persist_record(&self, record: &RunRecord) {
        if let Err(err) = journal::save(&self.paths, record) {
            tracing::error!(run_id = %record.run_id, error = %format!("{err:#}"), "failed to write run record");
        }
    }

    fn summary(
        &self,
        record: &RunRecord,
        tally: &Tally,
        anomalies: TransitionCounts,
        archive_list_entries: Option<u64>,
    ) -> RunSummary {
        RunSummary {
            run_id: record.run_id.clone(),
            list_id: record.list_id.clone(),
            status: record.status,
            failure_category: record.failure_category,
            error: record.error.clone(),
            catalog_snapshot_id: record.catalog_snapshot_id.clone(),
            inventory_report_id: record.inventory_report_id.clone(),
            counts_by_category: tally.counts_by_category.clone(),
            suppressed_orphans: tally.suppressed_orphans,
            catalog_rows: tally.catalog_rows,
            inventory_rows: tally.inventory_rows,
            anomalies,
            archive_list_entries,
            started_at: record.started_at,
            finished_at: record.finished_at.unwrap_or_else(Utc::now),
        }
    }

    /// Failed runs never report partial counts.
    fn failed_summary(
        &self,
        record: &RunRecord,
        err: &ReconError,
        tally: Option<&Tally>,
    ) -> RunSummary {
        let mut summary = self.summary(record, &Tally::default(), TransitionCounts::default(), None);
        summary.status = RunStatus::Failed;
        summary.failure_category = Some(err.category());
        summary.error = Some(err.to_string());
        if let Some(tally) = tally {
            summary.catalog_rows = tally.catalog_rows;
            summary.inventory_rows = tally.inventory_rows;
        }
        summary
    }
}
