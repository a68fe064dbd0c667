use anyhow::{Context, Result};
use chrono::Utc;
use std::fs;
use std::time::Duration;

use crate::cli::ReconcileEventsArgs;
use crate::commands::{CommandReport, load_context, report_run, resolve_list_id};
use crate::recon::catalog::SnapshotRef;
use crate::recon::config::MAX_GRACE_PERIOD_HOURS;
use crate::recon::events::parse_events;
use crate::recon::run::{ReconcileEngine, RunRequest, RunSummary};

pub fn run(args: &ReconcileEventsArgs) -> Result<CommandReport> {
    let raw = fs::read_to_string(&args.events)
        .with_context(|| format!("failed to read {}", args.events.display()))?;
    let batch = parse_events(&raw)?;

    let (paths, config) = load_context()?;
    let list_id = resolve_list_id(args.list.as_deref(), &config)?;
    let grace_period_hours = args
        .grace_hours
        .unwrap_or(config.reconcile.grace_period_hours);
    if grace_period_hours > MAX_GRACE_PERIOD_HOURS {
        anyhow::bail!("--grace-hours must be <= {MAX_GRACE_PERIOD_HOURS}");
    }
    let engine = ReconcileEngine::from_paths(paths, config);

    let mut report = CommandReport::new("reconcile-events");
    for skipped in &batch.skipped {
        report.detail(format!("skipped {skipped}"));
    }
    if batch.notices.is_empty() {
        report.detail("no inventory manifests in event file");
    }

    let mut summaries: Vec<RunSummary> = Vec::with_capacity(batch.notices.len());
    for notice in &batch.notices {
        tracing::info!(
            bucket = %notice.bucket,
            manifest = %notice.manifest_key,
            report = %notice.report_id,
            "inventory report announced"
        );
        let summary = engine.run(&RunRequest {
            list_id: list_id.clone(),
            catalog: SnapshotRef::Latest,
            inventory_report_id: notice.report_id.clone(),
            grace_period: Duration::from_secs(grace_period_hours * 3600),
            as_of: Utc::now(),
        });
        report_run(&mut report, &summary);
        summaries.push(summary);
    }
    report.attach(&summaries)?;
    Ok(report)
}
