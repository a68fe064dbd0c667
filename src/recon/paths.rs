use anyhow::Result;
use std::env;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct LedgerPaths {
    pub home: PathBuf,
    pub catalog_dir: PathBuf,
    pub inventory_dir: PathBuf,
    pub state_dir: PathBuf,
    pub logs_dir: PathBuf,
}

impl LedgerPaths {
    /// Lay out every directory under a single root.
    pub fn under(root: &Path) -> Self {
        Self {
            home: root.to_path_buf(),
            catalog_dir: root.join("catalog"),
            inventory_dir: root.join("inventory"),
            state_dir: root.join("state"),
            logs_dir: root.join("logs"),
        }
    }

    pub fn archive_list_dir(&self, list_id: &str) -> PathBuf {
        self.state_dir.join("archive_lists").join(list_id)
    }

    pub fn anomaly_store_file(&self, list_id: &str) -> PathBuf {
        self.state_dir
            .join("anomalies")
            .join(format!("{list_id}.json"))
    }

    pub fn anomaly_events_file(&self, list_id: &str) -> PathBuf {
        self.state_dir
            .join("anomalies")
            .join(format!("{list_id}.events.jsonl"))
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.state_dir.join("runs")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.state_dir.join("locks")
    }
}

fn required_home_dir() -> Result<PathBuf> {
    if let Some(home) = dirs::home_dir() {
        return Ok(home);
    }
    Err(anyhow::anyhow!("HOME directory could not be resolved"))
}

fn env_or_default_path(var: &str, fallback: PathBuf) -> PathBuf {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => PathBuf::from(v.trim()),
        _ => fallback,
    }
}

pub fn resolve_home() -> Result<PathBuf> {
    match env::var("COLD_LEDGER_HOME") {
        Ok(v) if !v.trim().is_empty() => Ok(PathBuf::from(v.trim())),
        _ => Ok(required_home_dir()?.join("cold-ledger")),
    }
}

pub fn resolve_paths() -> Result<LedgerPaths> {
    let home = resolve_home()?;
    let defaults = LedgerPaths::under(&home);

    Ok(LedgerPaths {
        catalog_dir: env_or_default_path("COLD_LEDGER_CATALOG_DIR", defaults.catalog_dir),
        inventory_dir: env_or_default_path("COLD_LEDGER_INVENTORY_DIR", defaults.inventory_dir),
        state_dir: env_or_default_path("COLD_LEDGER_STATE_DIR", defaults.state_dir),
        logs_dir: env_or_default_path("COLD_LEDGER_LOGS_DIR", defaults.logs_dir),
        home,
    })
}

#[cfg(test)]
mod tests {
    use super::LedgerPaths;
    use std::path::Path;

    #[test]
    fn state_files_are_keyed_by_list_id() {
        let paths = LedgerPaths::under(Path::new("/srv/ledger"));
        assert_eq!(
            paths.archive_list_dir("dr-east"),
            Path::new("/srv/ledger/state/archive_lists/dr-east")
        );
        assert_eq!(
            paths.anomaly_store_file("dr-east"),
            Path::new("/srv/ledger/state/anomalies/dr-east.json")
        );
        assert_eq!(paths.locks_dir(), Path::new("/srv/ledger/state/locks"));
    }
}
