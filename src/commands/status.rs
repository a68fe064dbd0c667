use anyhow::Result;
use serde_json::json;

use crate::cli::StatusArgs;
use crate::commands::{CommandReport, load_context, resolve_list_id};
use crate::recon::archive_list::load_pointer;
use crate::recon::config::resolve_config_path;
use crate::recon::lock::{LockState, inspect};

pub fn run(args: &StatusArgs) -> Result<CommandReport> {
    let (paths, config) = load_context()?;
    let list_id = resolve_list_id(args.list.as_deref(), &config)?;
    let mut report = CommandReport::new("status");

    let config_path = resolve_config_path(&paths.home);
    report.detail(format!("home={}", paths.home.display()));
    report.detail(format!(
        "config={}{}",
        config_path.display(),
        if config_path.exists() { "" } else { " (defaults)" }
    ));
    for (name, path) in [
        ("catalog_dir", &paths.catalog_dir),
        ("inventory_dir", &paths.inventory_dir),
        ("state_dir", &paths.state_dir),
        ("logs_dir", &paths.logs_dir),
    ] {
        if path.exists() {
            report.detail(format!("{name}={}", path.display()));
        } else {
            report.detail(format!("{name}={} (missing)", path.display()));
        }
    }
    report.detail(format!(
        "reconcile.default_list_id={} reconcile.grace_period_hours={}",
        config.reconcile.default_list_id, config.reconcile.grace_period_hours
    ));
    report.detail(format!(
        "fetch.page_size={} fetch.prefetch_pages={} fetch.page_timeout_secs={}",
        config.fetch.page_size, config.fetch.prefetch_pages, config.fetch.page_timeout_secs
    ));
    report.detail(format!(
        "retry.max_attempts={} retry.base_delay_ms={} retry.max_delay_ms={}",
        config.retry.max_attempts, config.retry.base_delay_ms, config.retry.max_delay_ms
    ));
    report.detail(format!(
        "retention.keep_generations={}",
        config.retention.keep_generations
    ));

    let lock = inspect(&paths, &list_id)?;
    let lock_json = match &lock {
        LockState::Free => {
            report.detail(format!("lock.{list_id}=free"));
            json!({ "state": "free" })
        }
        LockState::Held(payload) => {
            match payload {
                Some(p) => report.detail(format!(
                    "lock.{list_id}=held pid={} run={} build={} since={}",
                    p.pid,
                    p.run_id,
                    p.build_uuid,
                    p.started_at.to_rfc3339()
                )),
                None => report.detail(format!("lock.{list_id}=held (no payload)")),
            }
            json!({ "state": "held", "holder": payload })
        }
    };

    let pointer = match load_pointer(&paths.archive_list_dir(&list_id)) {
        Ok(pointer) => pointer,
        Err(err) => {
            report.issue(format!("archive list pointer unreadable: {err:#}"));
            None
        }
    };
    match &pointer {
        Some(p) => report.detail(format!(
            "archive_list.{list_id} run={} generation={} entries={} committed_at={}",
            p.run_id,
            p.generation,
            p.entry_count,
            p.committed_at.to_rfc3339()
        )),
        None => report.detail(format!("archive_list.{list_id}=none")),
    }

    report.attach(&json!({
        "paths": {
            "home": paths.home,
            "catalog_dir": paths.catalog_dir,
            "inventory_dir": paths.inventory_dir,
            "state_dir": paths.state_dir,
            "logs_dir": paths.logs_dir,
        },
        "config": config,
        "lock": lock_json,
        "archive_list": pointer,
    }))?;
    Ok(report)
}
