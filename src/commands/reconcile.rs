use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::cli::ReconcileArgs;
use crate::commands::{CommandReport, load_context, report_run, resolve_list_id};
use crate::recon::catalog::SnapshotRef;
use crate::recon::config::MAX_GRACE_PERIOD_HOURS;
use crate::recon::run::{ReconcileEngine, RunRequest};

fn parse_as_of(raw: Option<&str>) -> Result<DateTime<Utc>> {
    match raw {
        Some(raw) => Ok(DateTime::parse_from_rfc3339(raw.trim())
            .with_context(|| format!("invalid --as-of `{raw}`: expected RFC3339"))?
            .with_timezone(&Utc)),
        None => Ok(Utc::now()),
    }
}

pub fn run(args: &ReconcileArgs) -> Result<CommandReport> {
    let (paths, config) = load_context()?;
    let list_id = resolve_list_id(args.list.as_deref(), &config)?;
    let grace_period_hours = args
        .grace_hours
        .unwrap_or(config.reconcile.grace_period_hours);
    if grace_period_hours > MAX_GRACE_PERIOD_HOURS {
        anyhow::bail!("--grace-hours must be <= {MAX_GRACE_PERIOD_HOURS}");
    }
    let request = RunRequest {
        list_id,
        catalog: SnapshotRef::parse(&args.catalog),
        inventory_report_id: args.inventory.trim().to_string(),
        grace_period: Duration::from_secs(grace_period_hours * 3600),
        as_of: parse_as_of(args.as_of.as_deref())?,
    };

    let engine = ReconcileEngine::from_paths(paths, config);
    let summary = engine.run(&request);

    let mut report = CommandReport::new("reconcile");
    report_run(&mut report, &summary);
    report.attach(&summary)?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::parse_as_of;

    #[test]
    fn as_of_accepts_offsets_and_rejects_garbage() {
        let parsed = parse_as_of(Some("2026-01-10T02:00:00+02:00")).expect("parse");
        assert_eq!(parsed.to_rfc3339(), "2026-01-10T00:00:00+00:00");
        assert!(parse_as_of(Some("yesterday")).is_err());
    }
}
