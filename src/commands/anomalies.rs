use anyhow::Result;

use crate::cli::AnomaliesArgs;
use crate::commands::{CommandReport, load_context, resolve_list_id};
use crate::recon::anomaly::{AnomalyEvent, AnomalyRecord, AnomalyState, AnomalyStore, read_events};

fn describe(record: &AnomalyRecord) -> String {
    let state = match &record.state {
        AnomalyState::Open => "open".to_string(),
        AnomalyState::Closed {
            closed_in_run,
            resolution,
            ..
        } => format!("closed({}, run={closed_in_run})", resolution.as_str()),
    };
    format!(
        "{} status={} state={} first_seen={} last_seen={} hint=\"{}\"",
        record.key,
        record.status,
        state,
        record.first_seen_at.to_rfc3339(),
        record.last_seen_at.to_rfc3339(),
        record.remediation
    )
}

fn describe_event(event: &AnomalyEvent) -> String {
    let mut line = format!(
        "{} {} {} status={} run={}",
        event.at.to_rfc3339(),
        event.transition.as_str(),
        event.key,
        event.status,
        event.run_id
    );
    if let Some(resolution) = event.resolution {
        line.push_str(&format!(" resolution={}", resolution.as_str()));
    }
    line
}

pub fn run(args: &AnomaliesArgs) -> Result<CommandReport> {
    let (paths, config) = load_context()?;
    let list_id = resolve_list_id(args.list.as_deref(), &config)?;

    if args.history {
        let events = read_events(&paths, &list_id)?;
        let recent: Vec<&AnomalyEvent> = events.iter().rev().take(args.limit).collect();
        let mut report = CommandReport::new("anomalies");
        report.detail(format!("list={list_id} events={}", events.len()));
        for event in &recent {
            report.detail(describe_event(event));
        }
        report.attach(&recent)?;
        return Ok(report);
    }

    let store = AnomalyStore::load(&paths, &list_id)?;

    let records: Vec<&AnomalyRecord> = store
        .records
        .values()
        .filter(|r| args.all || r.is_open())
        .collect();

    let mut report = CommandReport::new("anomalies");
    report.detail(format!(
        "list={list_id} open={} total={}",
        store.open_count(),
        store.records.len()
    ));
    for record in &records {
        report.detail(describe(record));
    }
    report.attach(&records)?;
    Ok(report)
}
