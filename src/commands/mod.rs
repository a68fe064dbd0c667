pub mod anomalies;
pub mod archive_list;
pub mod reconcile;
pub mod reconcile_events;
pub mod runs;
pub mod status;

use anyhow::Result;
use serde::Serialize;

use crate::recon::config::{LedgerConfig, load_config, validate_list_id};
use crate::recon::paths::{LedgerPaths, resolve_paths};
use crate::recon::run::RunSummary;

#[derive(Debug, Clone, Serialize)]
pub struct CommandReport {
    pub command: String,
    pub ok: bool,
    pub details: Vec<String>,
    pub issues: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl CommandReport {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ok: true,
            details: Vec::new(),
            issues: Vec::new(),
            data: None,
        }
    }

    pub fn detail(&mut self, text: impl Into<String>) {
        self.details.push(text.into());
    }

    pub fn issue(&mut self, text: impl Into<String>) {
        self.ok = false;
        self.issues.push(text.into());
    }

    pub fn attach<T: Serialize>(&mut self, value: &T) -> Result<()> {
        self.data = Some(serde_json::to_value(value)?);
        Ok(())
    }
}

/// Paths and validated config, resolved the same way for every command.
pub fn load_context() -> Result<(LedgerPaths, LedgerConfig)> {
    let paths = resolve_paths()?;
    let config = load_config(&paths.home)?;
    Ok((paths, config))
}

pub fn resolve_list_id(requested: Option<&str>, config: &LedgerConfig) -> Result<String> {
    let list_id = requested
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(&config.reconcile.default_list_id)
        .to_string();
    validate_list_id(&list_id)?;
    Ok(list_id)
}

/// Fold one run summary into a report: counts as details, failure as an issue.
pub fn report_run(report: &mut CommandReport, summary: &RunSummary) {
    report.detail(format!(
        "run={} list={} status={}",
        summary.run_id, summary.list_id, summary.status
    ));
    if let Some(snapshot) = &summary.catalog_snapshot_id {
        report.detail(format!("catalog_snapshot={snapshot}"));
    }
    report.detail(format!("inventory_report={}", summary.inventory_report_id));
    for (status, count) in &summary.counts_by_category {
        report.detail(format!("{}={count}", status.as_str().to_ascii_lowercase()));
    }
    if summary.succeeded() {
        report.detail(format!("suppressed_orphans={}", summary.suppressed_orphans));
        report.detail(format!(
            "anomalies opened={} reopened={} refreshed={} closed={}",
            summary.anomalies.opened,
            summary.anomalies.reopened,
            summary.anomalies.refreshed,
            summary.anomalies.closed
        ));
        if let Some(entries) = summary.archive_list_entries {
            report.detail(format!("archive_list_entries={entries}"));
        }
    } else {
        report.issue(format!(
            "run {} failed [{}]: {}",
            summary.run_id,
            summary
                .failure_category
                .map(|c| c.as_str())
                .unwrap_or("unknown"),
            summary.error.as_deref().unwrap_or("no error recorded")
        ));
    }
}
