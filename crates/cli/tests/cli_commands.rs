// crates/cli/tests/cli_commands.rs

use std::fs;

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use tempfile::tempdir;

/// Running with no subcommand prints usage and fails.
#[test]
fn no_subcommand_fails_with_usage() {
    cargo_bin_cmd!("covdiff")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

/// `parse-coverage` must reject a missing coverage file before touching the
/// store.
#[test]
fn parse_coverage_fails_on_missing_input() {
    let temp = tempdir().expect("temp dir");
    let missing = temp.path().join("nope_a.txt");
    let coverage_b = temp.path().join("b.txt");
    let modules = temp.path().join("modules.json");
    fs::write(&coverage_b, "").expect("write b");
    fs::write(&modules, "{}").expect("write modules");

    cargo_bin_cmd!("covdiff")
        .arg("parse-coverage")
        .arg("-a")
        .arg(&missing)
        .arg("-b")
        .arg(&coverage_b)
        .arg("-m")
        .arg(&modules)
        .arg("-o")
        .arg(temp.path().join("cov.db"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("Coverage file A not found"));

    assert!(!temp.path().join("cov.db").exists(), "store must not be created on bad input");
}

/// `analyze` must reject missing stores.
#[test]
fn analyze_fails_on_missing_master_db() {
    let temp = tempdir().expect("temp dir");
    let cov = temp.path().join("cov.db");
    fs::write(&cov, "").expect("write placeholder");

    cargo_bin_cmd!("covdiff")
        .arg("analyze")
        .arg(temp.path().join("missing_master.db"))
        .arg(&cov)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Master DB not found"));
}

/// `analyze` against a master store missing the expected tables fails with
/// the offending table name.
#[test]
fn analyze_fails_on_master_without_schema() {
    let temp = tempdir().expect("temp dir");
    let master = temp.path().join("master.db");
    let cov = temp.path().join("cov.db");
    // An empty SQLite file has no tables at all.
    rusqlite::Connection::open(&master).expect("create empty db");
    rusqlite::Connection::open(&cov).expect("create empty db");

    cargo_bin_cmd!("covdiff")
        .arg("analyze")
        .arg(&master)
        .arg(&cov)
        .assert()
        .failure()
        .stderr(predicate::str::contains("analyzed_binaries"));
}

/// `export-viz` must reject missing stores.
#[test]
fn export_viz_fails_on_missing_coverage_db() {
    let temp = tempdir().expect("temp dir");
    let master = temp.path().join("master.db");
    fs::write(&master, "").expect("write placeholder");

    cargo_bin_cmd!("covdiff")
        .arg("export-viz")
        .arg(&master)
        .arg(temp.path().join("missing_cov.db"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("Coverage DB not found"));
}

/// `hash-modules` hashes every file in the directory into a JSON map.
#[test]
fn hash_modules_writes_name_to_hash_map() {
    use sha2::{Digest, Sha256};

    let temp = tempdir().expect("temp dir");
    let module_dir = temp.path().join("modules");
    fs::create_dir(&module_dir).expect("create module dir");
    fs::write(module_dir.join("target.exe"), b"fake module contents").expect("write module");

    let output = temp.path().join("modules.json");
    cargo_bin_cmd!("covdiff")
        .arg("hash-modules")
        .arg("--dir")
        .arg(&module_dir)
        .arg("-o")
        .arg(&output)
        .assert()
        .success()
        .stdout(predicate::str::contains("target.exe"));

    let map: std::collections::BTreeMap<String, String> =
        serde_json::from_str(&fs::read_to_string(&output).expect("read output"))
            .expect("parse output");
    let expected = format!("{:x}", Sha256::digest(b"fake module contents"));
    assert_eq!(map.get("target.exe"), Some(&expected));
}

/// `hash-modules` on a missing directory fails cleanly.
#[test]
fn hash_modules_fails_on_missing_directory() {
    let temp = tempdir().expect("temp dir");

    cargo_bin_cmd!("covdiff")
        .arg("hash-modules")
        .arg("--dir")
        .arg(temp.path().join("nope"))
        .arg("-o")
        .arg(temp.path().join("modules.json"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("Module directory not found"));
}
