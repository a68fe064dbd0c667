use std::env;
use tracing_subscriber::EnvFilter;

fn filter_from_env() -> EnvFilter {
    let raw = env::var("COLD_LEDGER_LOG").unwrap_or_default();
    if !raw.trim().is_empty() {
        if let Ok(filter) = EnvFilter::try_new(raw.trim()) {
            return filter;
        }
        eprintln!("warning: ignoring invalid COLD_LEDGER_LOG filter `{}`", raw.trim());
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Diagnostics go to stderr so `--json` output on stdout stays parseable.
pub fn init() {
    tracing_subscriber::fmt()
        .with_env_filter(filter_from_env())
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .ok();
}
