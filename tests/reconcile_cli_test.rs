mod common;

use common::{AS_OF, Ledger, OLD, stdout_json};
use predicates::prelude::*;
use std::fs;

fn seed_baseline(ledger: &Ledger) {
    ledger.write_catalog(
        "snap-2026-01-09",
        &[
            ("a", "DEEP_ARCHIVE", "aa"),
            ("b", "DEEP_ARCHIVE", "bb"),
            ("c", "GLACIER", "cc"),
        ],
    );
    ledger.write_inventory(
        "rep-1",
        &[
            &[("a", "DEEP_ARCHIVE", "AA", OLD), ("c", "GLACIER", "cc", OLD)],
            &[("b", "DEEP_ARCHIVE", "bb", OLD)],
        ],
    );
}

#[test]
fn reconcile_publishes_confirmed_keys_as_the_current_list() {
    let ledger = Ledger::new();
    seed_baseline(&ledger);

    let output = ledger
        .cmd()
        .args([
            "reconcile",
            "--catalog",
            "latest",
            "--inventory",
            "rep-1",
            "--as-of",
            AS_OF,
            "--json",
        ])
        .output()
        .expect("run reconcile");
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let report = stdout_json(&output);
    assert_eq!(report["ok"], true);
    assert_eq!(report["data"]["status"], "SUCCEEDED");
    assert_eq!(report["data"]["catalog_snapshot_id"], "snap-2026-01-09");
    assert_eq!(report["data"]["counts_by_category"]["CONFIRMED"], 3);

    let output = ledger
        .cmd()
        .args(["archive-list", "--json"])
        .output()
        .expect("archive-list");
    assert!(output.status.success());
    let report = stdout_json(&output);
    assert_eq!(report["data"]["pointer"]["entry_count"], 3);
    assert_eq!(report["data"]["counts_by_class"]["DEEP_ARCHIVE"], 2);

    ledger
        .cmd()
        .args(["archive-list", "--key", "dr-archive/b"])
        .assert()
        .success()
        .stdout(predicate::str::contains("class=DEEP_ARCHIVE"));
    ledger
        .cmd()
        .args(["archive-list", "--key", "dr-archive/B"])
        .assert()
        .failure();

    ledger
        .cmd()
        .args(["runs"])
        .assert()
        .success()
        .stdout(predicate::str::contains("status=SUCCEEDED"));
}

#[test]
fn unsorted_catalog_fails_as_data_integrity_and_publishes_nothing() {
    let ledger = Ledger::new();
    ledger.write_catalog(
        "snap-1",
        &[("b", "GLACIER", "bb"), ("a", "GLACIER", "aa")],
    );
    ledger.write_inventory("rep-1", &[&[("a", "GLACIER", "aa", OLD)]]);

    ledger
        .cmd()
        .args(["reconcile", "--catalog", "snap-1", "--inventory", "rep-1"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("data_integrity"))
        .stdout(predicate::str::contains("unsorted catalog input"));

    ledger
        .cmd()
        .args(["archive-list"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("no committed generation"));
    ledger
        .cmd()
        .args(["runs"])
        .assert()
        .success()
        .stdout(predicate::str::contains("failure=data_integrity"));
}

#[test]
fn incomplete_inventory_keeps_the_previous_list() {
    let ledger = Ledger::new();
    seed_baseline(&ledger);
    ledger
        .cmd()
        .args(["reconcile", "--catalog", "latest", "--inventory", "rep-1", "--as-of", AS_OF])
        .assert()
        .success();

    ledger.write_inventory("rep-2", &[&[("a", "DEEP_ARCHIVE", "aa", OLD)]]);
    fs::remove_file(ledger.inventory_dir().join("rep-2/data/part-0.jsonl")).expect("drop part");

    ledger
        .cmd()
        .args(["reconcile", "--catalog", "latest", "--inventory", "rep-2"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("is incomplete"));

    let output = ledger
        .cmd()
        .args(["archive-list", "--json"])
        .output()
        .expect("archive-list");
    let report = stdout_json(&output);
    assert_eq!(report["data"]["pointer"]["entry_count"], 3);
}

#[test]
fn missing_object_opens_then_closes_an_anomaly() {
    let ledger = Ledger::new();
    ledger.write_catalog("snap-1", &[("a", "GLACIER", "aa"), ("b", "GLACIER", "bb")]);
    ledger.write_inventory("rep-1", &[&[("a", "GLACIER", "aa", OLD)]]);

    ledger
        .cmd()
        .args(["reconcile", "--catalog", "snap-1", "--inventory", "rep-1", "--as-of", AS_OF])
        .assert()
        .success()
        .stderr(predicate::str::contains(
            "COLD_LEDGER_ANOMALY transition=opened list=default",
        ))
        .stderr(predicate::str::contains("status=MISSING_FROM_STORAGE"));

    let output = ledger
        .cmd()
        .args(["anomalies", "--json"])
        .output()
        .expect("anomalies");
    let report = stdout_json(&output);
    assert_eq!(report["data"][0]["key"], "dr-archive/b");
    assert_eq!(report["data"][0]["state"], "open");

    ledger.write_inventory(
        "rep-2",
        &[&[("a", "GLACIER", "aa", OLD), ("b", "GLACIER", "bb", OLD)]],
    );
    ledger
        .cmd()
        .args(["reconcile", "--catalog", "snap-1", "--inventory", "rep-2", "--as-of", AS_OF])
        .assert()
        .success()
        .stderr(predicate::str::contains("transition=closed"));

    let output = ledger
        .cmd()
        .args(["anomalies", "--json"])
        .output()
        .expect("anomalies");
    assert_eq!(stdout_json(&output)["data"], serde_json::json!([]));

    let output = ledger
        .cmd()
        .args(["anomalies", "--all", "--json"])
        .output()
        .expect("anomalies --all");
    let report = stdout_json(&output);
    assert_eq!(report["data"][0]["state"], "closed");
    assert_eq!(report["data"][0]["resolution"], "confirmed");

    let output = ledger
        .cmd()
        .args(["anomalies", "--history", "--json"])
        .output()
        .expect("anomalies --history");
    let report = stdout_json(&output);
    let transitions: Vec<&str> = report["data"]
        .as_array()
        .expect("array")
        .iter()
        .filter_map(|e| e["transition"].as_str())
        .collect();
    assert_eq!(transitions, vec!["closed", "opened"]);
}

#[test]
fn orphan_inside_grace_window_is_reported_without_an_anomaly() {
    let ledger = Ledger::new();
    ledger.write_catalog("snap-1", &[]);
    ledger.write_inventory(
        "rep-1",
        &[&[
            ("fresh", "GLACIER", "ff", "2026-01-09T23:00:00Z"),
            ("stale", "GLACIER", "ss", OLD),
        ]],
    );

    let output = ledger
        .cmd()
        .args([
            "reconcile",
            "--catalog",
            "snap-1",
            "--inventory",
            "rep-1",
            "--as-of",
            AS_OF,
            "--grace-hours",
            "6",
            "--json",
        ])
        .output()
        .expect("reconcile");
    assert!(output.status.success());
    let report = stdout_json(&output);
    assert_eq!(report["data"]["counts_by_category"]["ORPHANED_IN_STORAGE"], 2);
    assert_eq!(report["data"]["suppressed_orphans"], 1);
    assert_eq!(report["data"]["anomalies"]["opened"], 1);

    let output = ledger
        .cmd()
        .args(["anomalies", "--json"])
        .output()
        .expect("anomalies");
    let report = stdout_json(&output);
    let keys: Vec<&str> = report["data"]
        .as_array()
        .expect("array")
        .iter()
        .filter_map(|r| r["key"].as_str())
        .collect();
    assert_eq!(keys, vec!["dr-archive/stale"]);
}

#[test]
fn unknown_snapshot_is_an_invalid_request() {
    let ledger = Ledger::new();
    seed_baseline(&ledger);
    ledger
        .cmd()
        .args(["reconcile", "--catalog", "snap-missing", "--inventory", "rep-1"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("invalid_request"));
}
