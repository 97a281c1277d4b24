// SPDX-License-Identifier: AGPL-3.0-or-later

//! Integration tests for `lurebot check`

use assert_cmd::Command;
use predicates::prelude::*;
use predicates::str::contains;
use std::path::PathBuf;

fn fixtures_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures")
}

fn check(args: &[&str]) -> Command {
    let mut cmd = Command::cargo_bin("lurebot").unwrap();
    cmd.env_remove("RUST_LOG")
        .arg("check")
        .arg("--licenses")
        .arg(fixtures_path().join("licenses.json"))
        .args(args);
    cmd
}

fn recipe(name: &str) -> String {
    fixtures_path()
        .join("recipes")
        .join(name)
        .join("lure.sh")
        .to_string_lossy()
        .into_owned()
}

#[test]
fn test_clean_recipe_passes() {
    check(&[recipe("hello").as_str()])
        .assert()
        .success()
        .stdout(contains("hello/lure.sh:\n\tNo issues found!"));
}

#[test]
fn test_broken_recipe_fails_with_findings() {
    check(&[recipe("broken").as_str()])
        .assert()
        .code(1)
        .stdout(contains("The release variable must be an integer"))
        .stdout(contains("Did you mean 'MIT-0'?"))
        .stdout(contains("\t\tA list of SPDX license identifiers"))
        .stdout(contains("The architectures variable must be set to 'all'"))
        .stdout(contains("invalid parameter name '~rename'"))
        .stdout(contains("not the same size as its corresponding sources array"))
        .stdout(contains("~tag").not());
}

#[test]
fn test_unparsable_recipe_is_reported() {
    check(&[recipe("unparsable").as_str()])
        .assert()
        .code(1)
        .stdout(contains("Error running script: line 2"));
}

#[test]
fn test_directory_is_walked() {
    let recipes = fixtures_path().join("recipes");
    check(&[&*recipes.to_string_lossy()])
        .assert()
        .code(1)
        .stdout(contains("broken/lure.sh:"))
        .stdout(contains("hello/lure.sh:"))
        .stdout(contains("unparsable/lure.sh:"));
}

#[test]
fn test_json_output() {
    let output = check(&["--format", "json", recipe("broken").as_str()])
        .assert()
        .code(1)
        .get_output()
        .stdout
        .clone();
    let report: serde_json::Value = serde_json::from_slice(&output).unwrap();
    let findings = report["files"][0]["findings"].as_array().unwrap();
    assert_eq!(findings.len(), 6);
    assert!(findings
        .iter()
        .any(|f| f["item"] == "checksums[0] element"));
}

#[test]
fn test_sarif_output() {
    let output = check(&["--format", "sarif", recipe("hello").as_str()])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let sarif: serde_json::Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(sarif["version"], "2.1.0");
    assert!(sarif["runs"][0]["results"].as_array().unwrap().is_empty());
}

#[test]
fn test_missing_path_is_an_error() {
    check(&["/nonexistent/lure.sh"]).assert().failure();
}

#[test]
fn test_paths_are_required() {
    Command::cargo_bin("lurebot")
        .unwrap()
        .arg("check")
        .assert()
        .failure()
        .stderr(contains("required"));
}
