#![allow(missing_docs)]

use std::fs;
use std::path::PathBuf;

use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::Value;
use tempfile::TempDir;

fn setup_db() -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("ipam.db");
    (dir, path)
}

fn run_json(db: &PathBuf, args: &[&str]) -> Value {
    let output = cargo_bin_cmd!("ipam")
        .arg("--db")
        .arg(db)
        .args(["--format", "json"])
        .args(args)
        .env("RUST_LOG", "off")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    serde_json::from_slice(&output).expect("json output")
}

const SCOPE: [&str; 4] = ["--vpc", "vpc-a", "--region", "us"];

#[test]
fn allocate_check_release_round() {
    let (_dir, db) = setup_db();

    let mut allocate = vec!["allocate", "--cidr", "10.0.0.0/24"];
    allocate.extend(SCOPE);
    allocate.extend(["--resource-type", "subnet", "--resource-name", "web"]);
    let allocation = run_json(&db, &allocate);
    assert_eq!(allocation["block"], "10.0.0.0/24");
    assert_eq!(allocation["status"], "ALLOCATED");
    let id = allocation["id"].as_u64().expect("numeric id");

    let mut check = vec!["check", "--cidr", "10.0.0.0/23", "--mode", "partial"];
    check.extend(SCOPE);
    let result = run_json(&db, &check);
    assert_eq!(result["is_free"], true);
    assert_eq!(result["conflicts"][0], "10.0.0.0/24");
    assert_eq!(result["free_subranges"][0], "10.0.1.0/24");

    let id_text = id.to_string();
    let mut release = vec!["release", "--id", id_text.as_str()];
    release.extend(SCOPE);
    let released = run_json(&db, &release);
    assert_eq!(released["status"], "RELEASED");

    let listed = run_json(&db, &["list"]);
    assert_eq!(listed.as_array().map(Vec::len), Some(1));

    let audit = run_json(&db, &["audit", "--limit", "5"]);
    assert_eq!(audit[0]["action"], "release");
    assert_eq!(audit[1]["action"], "allocate");
}

#[test]
fn conflicting_allocation_fails() {
    let (_dir, db) = setup_db();
    let mut allocate = vec!["allocate", "--cidr", "10.0.0.0/16"];
    allocate.extend(SCOPE);
    allocate.extend(["--resource-type", "vpc", "--resource-name", "main"]);
    run_json(&db, &allocate);

    let mut clash = vec!["allocate", "--cidr", "10.0.5.0/24"];
    clash.extend(SCOPE);
    clash.extend(["--resource-type", "subnet", "--resource-name", "x"]);
    let assert = cargo_bin_cmd!("ipam")
        .arg("--db")
        .arg(&db)
        .args(&clash)
        .env("RUST_LOG", "off")
        .assert()
        .failure();
    let stderr = String::from_utf8_lossy(&assert.get_output().stderr).into_owned();
    assert!(stderr.contains("conflicts with 10.0.0.0/16"), "{stderr}");

    let refused = run_json(&db, &["audit", "--outcome", "failed"]);
    assert_eq!(refused.as_array().map(Vec::len), Some(1));
    assert_eq!(refused[0]["action"], "allocate");
    assert_eq!(refused[0]["ok"], false);
    assert_eq!(refused[0]["subject"], "10.0.5.0/24");

    let committed = run_json(&db, &["audit", "--outcome", "ok", "--action", "allocate"]);
    assert_eq!(committed.as_array().map(Vec::len), Some(1));
    assert_eq!(committed[0]["subject"], "10.0.0.0/16");

    let future = run_json(&db, &["audit", "--since", "2999-01-01T00:00:00Z"]);
    assert_eq!(future.as_array().map(Vec::len), Some(0));
    let paged = run_json(&db, &["audit", "--offset", "1", "--limit", "1"]);
    assert_eq!(paged[0]["ok"], true);

    cargo_bin_cmd!("ipam")
        .arg("--db")
        .arg(&db)
        .args(["audit", "--action", "bogus"])
        .env("RUST_LOG", "off")
        .assert()
        .failure();
}

#[test]
fn pool_commands() {
    let (_dir, db) = setup_db();
    let mut create = vec![
        "pool", "create", "--name", "apps", "--parent", "10.8.0.0/22", "--prefixes", "24,23",
    ];
    create.extend(SCOPE);
    let pool = run_json(&db, &create);
    assert_eq!(pool["allowed_prefixes"], serde_json::json!([23, 24]));

    let base = [
        "pool",
        "allocate",
        "--name",
        "apps",
        "--prefix",
        "24",
        "--resource-type",
        "subnet",
        "--resource-name",
        "svc",
    ];
    let mut dry = base.to_vec();
    dry.push("--dry-run");
    let preview = run_json(&db, &dry);
    assert_eq!(preview["outcome"], "dry_run");
    assert_eq!(preview["block"], "10.8.0.0/24");

    let grant = run_json(&db, &base);
    assert_eq!(grant["outcome"], "allocated");
    assert_eq!(grant["allocation"]["block"], "10.8.0.0/24");

    let summary = run_json(&db, &["pool", "summary", "--name", "apps"]);
    assert_eq!(summary["used"], 256);
    assert_eq!(summary["utilization_pct"], 25.0);
}

#[test]
fn reconcile_reports_drift() {
    let (dir, db) = setup_db();
    let mut allocate = vec!["allocate", "--cidr", "10.0.0.0/24"];
    allocate.extend(SCOPE);
    allocate.extend(["--resource-type", "subnet", "--resource-name", "web"]);
    run_json(&db, &allocate);

    let inventory = dir.path().join("inventory.json");
    fs::write(
        &inventory,
        r#"[
            {"scope": {"vpc": "vpc-a", "region": "us"}, "block": "10.0.0.0/24",
             "resource_type": "subnet", "resource_name": "web"},
            {"scope": {"vpc": "vpc-a", "region": "us"}, "block": "10.0.2.0/24",
             "resource_type": "subnet", "resource_name": "batch"}
        ]"#,
    )
    .expect("write inventory");
    let report = run_json(&db, &["reconcile", inventory.to_str().expect("utf8 path")]);
    assert_eq!(report["adopted"][0]["block"], "10.0.2.0/24");
    assert_eq!(report["already_tracked"][0]["block"], "10.0.0.0/24");
    assert_eq!(report["conflicts"].as_array().map(Vec::len), Some(0));
}

#[test]
fn config_file_supplies_database_path() {
    let dir = TempDir::new().expect("tempdir");
    let db = dir.path().join("from-config.db");
    let config = dir.path().join("config.toml");
    fs::write(
        &config,
        format!("[database]\npath = {:?}\n", db.to_str().expect("utf8 path")),
    )
    .expect("write config");

    cargo_bin_cmd!("ipam")
        .arg("--config")
        .arg(&config)
        .args(["get", "1"])
        .env("RUST_LOG", "off")
        .env_remove("IPAM_DB")
        .assert()
        .failure();
    assert!(db.exists());
}
