use std::env;
use std::path::PathBuf;

include!(concat!(env!("OUT_DIR"), "/cold_ledger_env_allowlist.rs"));

fn fallback_dotenv_path(ledger_home: Option<PathBuf>, home_dir: Option<PathBuf>) -> Option<PathBuf> {
    match ledger_home {
        Some(home) => Some(home.join(".env")),
        None => Some(home_dir?.join("cold-ledger/.env")),
    }
}

pub fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    let fallback = fallback_dotenv_path(
        env::var_os("COLD_LEDGER_HOME").map(PathBuf::from),
        dirs::home_dir(),
    );

    let Some(path) = fallback else {
        return;
    };
    if path.is_file() {
        let _ = dotenvy::from_path(&path);
    }
}

fn unknown_keys<I: IntoIterator<Item = String>>(keys: I) -> Vec<String> {
    let mut unknown: Vec<String> = keys
        .into_iter()
        .filter(|k| k.starts_with("COLD_LEDGER_"))
        .filter(|k| !GENERATED_COLD_LEDGER_ENV_ALLOWLIST.contains(&k.as_str()))
        .collect();
    unknown.sort();
    unknown
}

/// Typos in override names would otherwise be silently ignored.
pub fn warn_unknown_env_keys() {
    for key in unknown_keys(env::vars_os().filter_map(|(k, _)| k.into_string().ok())) {
        tracing::warn!(key = %key, "unrecognized COLD_LEDGER_ environment variable");
    }
}
