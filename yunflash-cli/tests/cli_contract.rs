//! Integration tests for core CLI contract behavior.

use {predicates::prelude::*, std::fs, tempfile::tempdir};

fn cli_cmd() -> assert_cmd::Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("yunflash");
    cmd.env_remove("YUNFLASH_PORT")
        .env_remove("YUNFLASH_BOARD")
        .env("NO_COLOR", "1");
    cmd
}

#[test]
fn help_exits_zero_and_writes_stdout_only() {
    cli_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("yunflash"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn version_exits_zero_and_writes_stdout_only() {
    cli_cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("yunflash"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn provision_help_lists_options() {
    cli_cmd()
        .args(["provision", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--serverip"))
        .stdout(predicate::str::contains("--bl"))
        .stdout(predicate::str::contains("--no-mcu"));
}

#[test]
fn list_ports_json_returns_valid_json() {
    let output = cli_cmd()
        .args(["list-ports", "--json"])
        .output()
        .expect("command should execute");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    let parsed: serde_json::Value =
        serde_json::from_str(&stdout).expect("stdout should be JSON");
    assert_eq!(parsed["ok"], true);
    assert!(parsed["data"]["ports"].is_array());
}

#[test]
fn list_ports_plain_writes_stderr_only() {
    cli_cmd()
        .arg("list-ports")
        .assert()
        .success()
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("serial ports"));
}

#[test]
fn completions_bash_succeeds() {
    cli_cmd()
        .args(["completions", "bash"])
        .assert()
        .success()
        .code(0)
        .stdout(predicate::str::contains("yunflash"));
}

#[test]
fn exit_code_two_for_unknown_command() {
    cli_cmd()
        .arg("unknown-command-xyz")
        .assert()
        .failure()
        .code(2);
}

#[test]
fn exit_code_two_for_invalid_address() {
    cli_cmd()
        .args(["provision", "--serverip", "not-an-ip"])
        .assert()
        .failure()
        .code(2)
        .stdout(predicate::str::is_empty());
}

#[test]
fn exit_code_two_for_half_address_override() {
    cli_cmd()
        .args(["provision", "--serverip", "192.168.1.10"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("--boardip"));
}

#[test]
fn missing_tftp_dir_fails_before_touching_hardware() {
    let dir = tempdir().expect("tempdir should be created");
    let missing = dir.path().join("no-such-tftp");

    cli_cmd()
        .current_dir(dir.path())
        .arg("provision")
        .arg("--serverip")
        .arg("127.0.0.1")
        .arg("--boardip")
        .arg("127.0.0.2")
        .arg("--tftp-dir")
        .arg(&missing)
        .assert()
        .failure()
        .code(1)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("TFTP directory"));
}

#[test]
fn missing_avr_dir_suggests_no_mcu() {
    let dir = tempdir().expect("tempdir should be created");
    let tftp = dir.path().join("tftp");
    fs::create_dir(&tftp).expect("create tftp dir");

    cli_cmd()
        .current_dir(dir.path())
        .arg("provision")
        .arg("--tftp-dir")
        .arg(&tftp)
        .arg("--avr-dir")
        .arg(dir.path().join("no-such-avr"))
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("--no-mcu"));
}

#[test]
fn invalid_local_config_is_a_warning() {
    let dir = tempdir().expect("tempdir should be created");
    fs::write(dir.path().join("yunflash.toml"), "invalid toml [[[").expect("write config");

    let output = cli_cmd()
        .current_dir(dir.path())
        .arg("list-ports")
        .output()
        .expect("command should execute");

    assert!(output.status.success(), "config errors are not fatal");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Failed to parse config file"));
}
