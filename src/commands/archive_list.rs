use anyhow::Result;
use serde_json::json;

use crate::cli::ArchiveListArgs;
use crate::commands::{CommandReport, load_context, resolve_list_id};
use crate::recon::archive_list::ArchiveList;

pub fn run(args: &ArchiveListArgs) -> Result<CommandReport> {
    let (paths, config) = load_context()?;
    let list_id = resolve_list_id(args.list.as_deref(), &config)?;
    let mut report = CommandReport::new("archive-list");

    let Some(list) = ArchiveList::open(&paths.archive_list_dir(&list_id))? else {
        report.issue(format!("archive list `{list_id}` has no committed generation yet"));
        return Ok(report);
    };
    let pointer = list.pointer();
    report.detail(format!(
        "list={} run={} committed_at={} entries={}",
        pointer.list_id,
        pointer.run_id,
        pointer.committed_at.to_rfc3339(),
        list.len()
    ));

    if let Some(key) = args.key.as_deref() {
        match list.get(key) {
            Some(entry) => {
                report.detail(format!(
                    "{} class={} checksum={} size={}",
                    entry.key, entry.storage_class, entry.checksum, entry.size
                ));
                report.attach(&json!({ "pointer": pointer, "entry": entry }))?;
            }
            None => report.issue(format!("key `{key}` is not in archive list `{list_id}`")),
        }
        return Ok(report);
    }

    if let Some(class) = args.class.as_deref() {
        let entries: Vec<_> = list.by_class(class).collect();
        report.detail(format!("class={class} count={}", entries.len()));
        for entry in &entries {
            report.detail(entry.key.clone());
        }
        report.attach(&json!({ "pointer": pointer, "entries": entries }))?;
        return Ok(report);
    }

    let counts = list.counts_by_class();
    for (class, count) in &counts {
        report.detail(format!("class={class} count={count}"));
    }
    report.attach(&json!({ "pointer": pointer, "counts_by_class": counts }))?;
    Ok(report)
}
