//! Black-box CLI tests driven through the built binary, `assert_cmd`-style.

use std::io::Write;

use assert_cmd::Command;
use predicates::str::contains;
use tempfile::NamedTempFile;

fn config_file(body: &str) -> NamedTempFile {
    let mut f = NamedTempFile::new().unwrap();
    f.write_all(body.as_bytes()).unwrap();
    f
}

#[test]
fn add_member_then_show_lists_it() {
    let cfg = config_file(
        r#"
        [sales]
        strategy = "ringall"
    "#,
    );
    let persistence = NamedTempFile::new().unwrap();

    Command::cargo_bin("acdqctl")
        .unwrap()
        .args(["--config", cfg.path().to_str().unwrap(), "--persistence", persistence.path().to_str().unwrap(), "add-member", "sales", "SIP/a", "--name", "Alice"])
        .assert()
        .success()
        .stdout(contains("AQMSTATUS=Ok"));

    Command::cargo_bin("acdqctl")
        .unwrap()
        .args(["--config", cfg.path().to_str().unwrap(), "--persistence", persistence.path().to_str().unwrap(), "show", "sales"])
        .assert()
        .success()
        .stdout(contains("SIP/a"));
}

#[test]
fn add_member_on_unknown_queue_reports_no_queue() {
    let cfg = config_file(
        r#"
        [sales]
        strategy = "ringall"
    "#,
    );
    let persistence = NamedTempFile::new().unwrap();

    Command::cargo_bin("acdqctl")
        .unwrap()
        .args(["--config", cfg.path().to_str().unwrap(), "--persistence", persistence.path().to_str().unwrap(), "add-member", "ghost", "SIP/a"])
        .assert()
        .success()
        .stdout(contains("AQMSTATUS=NoQueue"));
}

#[test]
fn pause_then_unpause_round_trips() {
    let cfg = config_file(
        r#"
        [sales]
        strategy = "ringall"
    "#,
    );
    let persistence = NamedTempFile::new().unwrap();

    Command::cargo_bin("acdqctl")
        .unwrap()
        .args(["--config", cfg.path().to_str().unwrap(), "--persistence", persistence.path().to_str().unwrap(), "add-member", "sales", "SIP/a"])
        .assert()
        .success();

    Command::cargo_bin("acdqctl")
        .unwrap()
        .args(["--config", cfg.path().to_str().unwrap(), "--persistence", persistence.path().to_str().unwrap(), "pause", "SIP/a", "--queue", "sales"])
        .assert()
        .success()
        .stdout(contains("PQMSTATUS=PAUSED"));

    Command::cargo_bin("acdqctl")
        .unwrap()
        .args(["--config", cfg.path().to_str().unwrap(), "--persistence", persistence.path().to_str().unwrap(), "unpause", "SIP/a", "--queue", "sales"])
        .assert()
        .success()
        .stdout(contains("UPQMSTATUS=UNPAUSED"));
}

#[test]
fn json_output_emits_valid_json() {
    let cfg = config_file(
        r#"
        [sales]
        strategy = "ringall"
    "#,
    );
    let persistence = NamedTempFile::new().unwrap();

    let output = Command::cargo_bin("acdqctl")
        .unwrap()
        .args(["--config", cfg.path().to_str().unwrap(), "--persistence", persistence.path().to_str().unwrap(), "--json", "show", "sales"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let parsed: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(parsed["queue"], "sales");
}
