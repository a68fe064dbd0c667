use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const MAX_GRACE_PERIOD_HOURS: u64 = 24 * 365 * 10;
pub const MAX_GRACE_PERIOD: Duration = Duration::from_secs(MAX_GRACE_PERIOD_HOURS * 3600);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileSection {
    pub default_list_id: String,
    pub grace_period_hours: u64,
}

impl Default for ReconcileSection {
    fn default() -> Self {
        Self {
            default_list_id: "default".to_string(),
            grace_period_hours: 24,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchSection {
    pub page_size: usize,
    pub prefetch_pages: usize,
    pub page_timeout_secs: u64,
}

impl Default for FetchSection {
    fn default() -> Self {
        Self {
            page_size: 1000,
            prefetch_pages: 4,
            page_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 200,
            max_delay_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionSection {
    pub keep_generations: usize,
}

impl Default for RetentionSection {
    fn default() -> Self {
        Self {
            keep_generations: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LedgerConfig {
    pub reconcile: ReconcileSection,
    pub fetch: FetchSection,
    pub retry: RetrySection,
    pub retention: RetentionSection,
}

impl LedgerConfig {
    pub fn page_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch.page_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialLedgerConfig {
    reconcile: Option<ReconcileSection>,
    fetch: Option<FetchSection>,
    retry: Option<RetrySection>,
    retention: Option<RetentionSection>,
}

fn env_or_u64(var: &str, fallback: u64) -> u64 {
    match env::var(var) {
        Ok(v) => v.trim().parse::<u64>().ok().unwrap_or(fallback),
        Err(_) => fallback,
    }
}

fn env_or_u32(var: &str, fallback: u32) -> u32 {
    match env::var(var) {
        Ok(v) => v.trim().parse::<u32>().ok().unwrap_or(fallback),
        Err(_) => fallback,
    }
}

fn env_or_usize(var: &str, fallback: usize) -> usize {
    match env::var(var) {
        Ok(v) => v.trim().parse::<usize>().ok().unwrap_or(fallback),
        Err(_) => fallback,
    }
}

fn env_or_string(var: &str, fallback: &str) -> String {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => fallback.to_string(),
    }
}

/// List ids become directory and file names.
pub fn validate_list_id(list_id: &str) -> Result<()> {
    if list_id.is_empty() {
        return Err(anyhow!("invalid archive list id: cannot be empty"));
    }
    if !list_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        || list_id.starts_with('.')
    {
        return Err(anyhow!(
            "invalid archive list id `{list_id}`: use ascii letters, digits, `-`, `_` or `.`"
        ));
    }
    Ok(())
}

fn validate(cfg: &LedgerConfig) -> Result<()> {
    validate_list_id(&cfg.reconcile.default_list_id)?;
    if cfg.reconcile.grace_period_hours > MAX_GRACE_PERIOD_HOURS {
        return Err(anyhow!(
            "invalid grace period: must be <= {MAX_GRACE_PERIOD_HOURS} hours"
        ));
    }
    if cfg.fetch.page_size == 0 {
        return Err(anyhow!("invalid fetch page size: must be >= 1"));
    }
    if cfg.fetch.prefetch_pages == 0 {
        return Err(anyhow!("invalid prefetch depth: must be >= 1 page"));
    }
    if cfg.fetch.page_timeout_secs == 0 {
        return Err(anyhow!("invalid page timeout: must be >= 1 second"));
    }
    if cfg.retry.max_attempts == 0 {
        return Err(anyhow!("invalid retry attempts: must be >= 1"));
    }
    if cfg.retry.max_delay_ms < cfg.retry.base_delay_ms {
        return Err(anyhow!(
            "invalid retry delays: require base_delay_ms <= max_delay_ms"
        ));
    }
    if cfg.retention.keep_generations == 0 {
        return Err(anyhow!("invalid generation retention: must keep >= 1"));
    }
    Ok(())
}

pub fn resolve_config_path(home: &Path) -> PathBuf {
    if let Ok(custom) = env::var("COLD_LEDGER_CONFIG_PATH") {
        let trimmed = custom.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }
    home.join("cold-ledger.toml")
}

fn merge_file_config(base: &mut LedgerConfig, raw: &str, origin: &Path) -> Result<()> {
    let parsed: PartialLedgerConfig = toml::from_str(raw)
        .map_err(|err| anyhow!("failed to parse config {}: {err}", origin.display()))?;
    if let Some(reconcile) = parsed.reconcile {
        base.reconcile = reconcile;
    }
    if let Some(fetch) = parsed.fetch {
        base.fetch = fetch;
    }
    if let Some(retry) = parsed.retry {
        base.retry = retry;
    }
    if let Some(retention) = parsed.retention {
        base.retention = retention;
    }
    Ok(())
}

fn apply_env_overrides(cfg: &mut LedgerConfig) {
    cfg.reconcile.default_list_id =
        env_or_string("COLD_LEDGER_LIST_ID", &cfg.reconcile.default_list_id);
    cfg.reconcile.grace_period_hours = env_or_u64(
        "COLD_LEDGER_GRACE_PERIOD_HOURS",
        cfg.reconcile.grace_period_hours,
    );
    cfg.fetch.page_size = env_or_usize("COLD_LEDGER_PAGE_SIZE", cfg.fetch.page_size);
    cfg.fetch.prefetch_pages =
        env_or_usize("COLD_LEDGER_PREFETCH_PAGES", cfg.fetch.prefetch_pages);
    cfg.fetch.page_timeout_secs =
        env_or_u64("COLD_LEDGER_PAGE_TIMEOUT_SECS", cfg.fetch.page_timeout_secs);
    cfg.retry.max_attempts = env_or_u32("COLD_LEDGER_RETRY_ATTEMPTS", cfg.retry.max_attempts);
    cfg.retry.base_delay_ms =
        env_or_u64("COLD_LEDGER_RETRY_BASE_DELAY_MS", cfg.retry.base_delay_ms);
    cfg.retry.max_delay_ms = env_or_u64("COLD_LEDGER_RETRY_MAX_DELAY_MS", cfg.retry.max_delay_ms);
    cfg.retention.keep_generations = env_or_usize(
        "COLD_LEDGER_KEEP_GENERATIONS",
        cfg.retention.keep_generations,
    );
}

pub fn load_config(home: &Path) -> Result<LedgerConfig> {
    let mut cfg = LedgerConfig::default();
    let path = resolve_config_path(home);
    if path.exists() {
        let raw = fs::read_to_string(&path)?;
        merge_file_config(&mut cfg, &raw, &path)?;
    }

    apply_env_overrides(&mut cfg);

    validate(&cfg)?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = LedgerConfig::default();
        validate(&cfg).expect("defaults are valid");
        assert_eq!(cfg.retry.max_attempts, 5);
        assert_eq!(cfg.page_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn file_sections_replace_defaults_wholesale() {
        let mut cfg = LedgerConfig::default();
        let raw = r#"
[fetch]
page_size = 250
prefetch_pages = 2
page_timeout_secs = 15

[retention]
keep_generations = 7
"#;
        merge_file_config(&mut cfg, raw, Path::new("cold-ledger.toml")).expect("merge");
        assert_eq!(cfg.fetch.page_size, 250);
        assert_eq!(cfg.fetch.prefetch_pages, 2);
        assert_eq!(cfg.retention.keep_generations, 7);
        assert_eq!(cfg.retry.max_attempts, 5);
    }

    #[test]
    fn missing_fields_in_a_section_keep_their_defaults() {
        let mut cfg = LedgerConfig::default();
        merge_file_config(&mut cfg, "[retry]\nmax_attempts = 9\n", Path::new("c.toml"))
            .expect("merge");
        assert_eq!(cfg.retry.max_attempts, 9);
        assert_eq!(cfg.retry.base_delay_ms, 200);
    }

    #[test]
    fn malformed_file_reports_its_path() {
        let mut cfg = LedgerConfig::default();
        let err = merge_file_config(&mut cfg, "[fetch\n", Path::new("/etc/ledger.toml"))
            .expect_err("should fail");
        assert!(format!("{err}").contains("/etc/ledger.toml"));
    }

    #[test]
    fn validate_rejects_inverted_retry_delays() {
        let mut cfg = LedgerConfig::default();
        cfg.retry.base_delay_ms = 10_000;
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn list_ids_must_be_path_safe() {
        assert!(validate_list_id("dr-east_1").is_ok());
        assert!(validate_list_id("../escape").is_err());
        assert!(validate_list_id("a/b").is_err());
        assert!(validate_list_id("").is_err());
    }
}
