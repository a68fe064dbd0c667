use anyhow::Result;

use crate::cli::RunsArgs;
use crate::commands::{CommandReport, load_context};
use crate::recon::journal;

pub fn run(args: &RunsArgs) -> Result<CommandReport> {
    let (paths, _config) = load_context()?;
    let records = journal::list(&paths, args.limit)?;

    let mut report = CommandReport::new("runs");
    if records.is_empty() {
        report.detail("no runs recorded");
    }
    for record in &records {
        let mut line = format!(
            "{} list={} status={} catalog={} inventory={} started_at={}",
            record.run_id,
            record.list_id,
            record.status,
            record
                .catalog_snapshot_id
                .as_deref()
                .unwrap_or(&record.catalog_snapshot),
            record.inventory_report_id,
            record.started_at.to_rfc3339()
        );
        if let Some(category) = record.failure_category {
            line.push_str(&format!(" failure={category}"));
        }
        report.detail(line);
    }
    report.attach(&records)?;
    Ok(report)
}
