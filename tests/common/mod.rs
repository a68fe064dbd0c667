#![allow(dead_code)]

use assert_cmd::Command;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub const BUCKET: &str = "dr-archive";

pub struct Ledger {
    pub tmp: TempDir,
}

impl Ledger {
    pub fn new() -> Self {
        Self {
            tmp: tempfile::tempdir().expect("tempdir"),
        }
    }

    pub fn home(&self) -> &Path {
        self.tmp.path()
    }

    pub fn catalog_dir(&self) -> PathBuf {
        self.home().join("catalog")
    }

    pub fn inventory_dir(&self) -> PathBuf {
        self.home().join("inventory")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.home().join("state")
    }

    pub fn cmd(&self) -> Command {
        let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("cold-ledger");
        cmd.current_dir(self.home())
            .env("COLD_LEDGER_HOME", self.home())
            .env("COLD_LEDGER_RETRY_BASE_DELAY_MS", "1")
            .env("COLD_LEDGER_RETRY_MAX_DELAY_MS", "2")
            .env("COLD_LEDGER_PAGE_SIZE", "2")
            .env_remove("COLD_LEDGER_CONFIG_PATH")
            .env_remove("COLD_LEDGER_LIST_ID");
        cmd
    }

    /// Catalog rows as (object key, storage class, checksum), written in the given order.
    pub fn write_catalog(&self, snapshot: &str, rows: &[(&str, &str, &str)]) {
        fs::create_dir_all(self.catalog_dir()).expect("mkdir catalog");
        let mut body = String::new();
        for (key, class, checksum) in rows {
            let line = serde_json::json!({
                "key": format!("{BUCKET}/{key}"),
                "expected_storage_class": class,
                "expected_checksum": checksum,
                "inserted_at": "2026-01-01T00:00:00Z",
            });
            body.push_str(&line.to_string());
            body.push('\n');
        }
        fs::write(self.catalog_dir().join(format!("{snapshot}.jsonl")), body)
            .expect("write catalog");
    }

    /// Inventory parts, each a list of (object key, storage class, checksum, last_modified).
    pub fn write_inventory(&self, report: &str, parts: &[&[(&str, &str, &str, &str)]]) {
        let dir = self.inventory_dir().join(report);
        fs::create_dir_all(dir.join("data")).expect("mkdir report");
        let mut files = Vec::new();
        for (idx, rows) in parts.iter().enumerate() {
            let mut body = String::new();
            for (key, class, checksum, modified) in rows.iter() {
                let line = serde_json::json!({
                    "bucket": BUCKET,
                    "key": key,
                    "size": 512,
                    "last_modified": modified,
                    "e_tag": format!("\"{checksum}\""),
                    "storage_class": class,
                });
                body.push_str(&line.to_string());
                body.push('\n');
            }
            let key = format!("data/part-{idx}.jsonl");
            fs::write(dir.join(&key), &body).expect("write part");
            files.push(serde_json::json!({
                "key": key,
                "size": body.len(),
                "sha256": format!("{:x}", Sha256::digest(body.as_bytes())),
            }));
        }
        let manifest = serde_json::json!({
            "report_id": report,
            "source_bucket": BUCKET,
            "generated_at": "2026-01-09T06:00:00Z",
            "file_format": "jsonl",
            "files": files,
        });
        fs::write(dir.join("manifest.json"), manifest.to_string()).expect("write manifest");
    }
}

pub fn stdout_json(output: &std::process::Output) -> serde_json::Value {
    serde_json::from_slice(&output.stdout).expect("stdout is a json report")
}

pub const OLD: &str = "2026-01-01T00:00:00Z";
pub const AS_OF: &str = "2026-01-10T00:00:00Z";
