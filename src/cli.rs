use anyhow::{Result, bail};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::commands::{self, CommandReport};

#[derive(Parser, Debug)]
#[command(
    name = "cold-ledger",
    version,
    about = "Reconcile cold-storage inventory reports against the archive catalog"
)]
pub struct Cli {
    #[arg(long, global = true, help = "Output machine-readable JSON")]
    pub json: bool,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run one reconciliation and publish the resulting archive list.
    Reconcile(ReconcileArgs),
    /// Reconcile every inventory report announced in a storage event file.
    ReconcileEvents(ReconcileEventsArgs),
    /// Query the current archive list.
    ArchiveList(ArchiveListArgs),
    /// Show anomaly records.
    Anomalies(AnomaliesArgs),
    /// Show recent runs, newest first.
    Runs(RunsArgs),
    /// Show resolved paths, effective config, locks and list pointers.
    Status(StatusArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ReconcileArgs {
    #[arg(long, help = "Catalog snapshot id, or `latest`")]
    pub catalog: String,
    #[arg(long, help = "Inventory report id")]
    pub inventory: String,
    #[arg(long, help = "Target archive list id (defaults to config)")]
    pub list: Option<String>,
    #[arg(long, help = "Orphan grace window in hours (defaults to config)")]
    pub grace_hours: Option<u64>,
    #[arg(long, help = "Reference time for the grace window, RFC3339")]
    pub as_of: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct ReconcileEventsArgs {
    #[arg(long, help = "JSON file holding a storage event `Records` document")]
    pub events: PathBuf,
    #[arg(long)]
    pub list: Option<String>,
    #[arg(long)]
    pub grace_hours: Option<u64>,
}

#[derive(Args, Debug, Clone)]
pub struct ArchiveListArgs {
    #[arg(long)]
    pub list: Option<String>,
    #[arg(long, conflicts_with = "class", help = "Look up a single key")]
    pub key: Option<String>,
    #[arg(long, help = "Only entries in this storage class")]
    pub class: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct AnomaliesArgs {
    #[arg(long)]
    pub list: Option<String>,
    #[arg(long, default_value_t = false, help = "Include closed anomalies")]
    pub all: bool,
    #[arg(long, conflicts_with = "all", help = "Show the transition log instead of records")]
    pub history: bool,
    #[arg(long, default_value_t = 50, help = "Number of log entries with --history")]
    pub limit: usize,
}

#[derive(Args, Debug, Clone)]
pub struct RunsArgs {
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[arg(long)]
    pub list: Option<String>,
}

fn render(report: &CommandReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    println!("{}: {}", report.command, if report.ok { "ok" } else { "failed" });
    for detail in &report.details {
        println!("  {detail}");
    }
    for issue in &report.issues {
        println!("  issue: {issue}");
    }
    Ok(())
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    let report = match &cli.command {
        Command::Reconcile(args) => commands::reconcile::run(args)?,
        Command::ReconcileEvents(args) => commands::reconcile_events::run(args)?,
        Command::ArchiveList(args) => commands::archive_list::run(args)?,
        Command::Anomalies(args) => commands::anomalies::run(args)?,
        Command::Runs(args) => commands::runs::run(args)?,
        Command::Status(args) => commands::status::run(args)?,
    };
    render(&report, cli.json)?;
    if !report.ok {
        bail!("{} finished with {} issue(s)", report.command, report.issues.len());
    }
    Ok(())
}
