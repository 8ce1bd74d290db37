//! End-to-end checks of the `bleota` binary against the simulated device.

use std::fs;
use std::path::PathBuf;

use predicates::prelude::*;
use tempfile::{TempDir, tempdir};

fn cli_cmd() -> assert_cmd::Command {
    assert_cmd::cargo::cargo_bin_cmd!("bleota")
}

fn image_file(len: usize) -> (TempDir, PathBuf) {
    let dir = tempdir().unwrap();
    let path = dir.path().join("fw.bin");
    let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    fs::write(&path, data).unwrap();
    (dir, path)
}

#[test]
fn help_lists_subcommands() {
    cli_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("simulate"))
        .stdout(predicate::str::contains("flash"));
}

#[test]
fn crc_prints_known_vector() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("check.bin");
    fs::write(&path, b"123456789").unwrap();

    cli_cmd()
        .arg("crc")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("0x31C3"));
}

#[test]
fn packetize_reports_sector_and_packet_counts() {
    let (_dir, path) = image_file(8000);

    cli_cmd()
        .args(["packetize", "--packet-size", "20"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("Sectors:      2"))
        .stdout(predicate::str::contains("Packets:      471"));
}

#[test]
fn simulate_succeeds() {
    let (_dir, path) = image_file(10_000);

    cli_cmd()
        .arg("simulate")
        .arg(&path)
        .assert()
        .success()
        .stderr(predicate::str::contains("Simulated device verified the image"));
}

#[test]
fn simulate_refused_start_exits_with_code() {
    let (_dir, path) = image_file(5000);

    cli_cmd()
        .arg("simulate")
        .arg(&path)
        .args(["--fault", "refuse-start"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("code 20"))
        .stderr(predicate::str::contains("Device refused start"));
}

#[test]
fn simulate_checksum_fault_exits_with_code() {
    let (_dir, path) = image_file(9000);

    cli_cmd()
        .arg("simulate")
        .arg(&path)
        .args(["--fault", "checksum:1"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("code 2)"));
}

#[test]
fn unknown_fault_is_rejected() {
    let (_dir, path) = image_file(100);

    cli_cmd()
        .arg("simulate")
        .arg(&path)
        .args(["--fault", "bogus"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown fault"));
}

#[test]
fn invalid_config_file_is_reported() {
    let (dir, path) = image_file(100);
    let config = dir.path().join("ota.toml");
    fs::write(&config, "mtu_request = 10\n").unwrap();

    cli_cmd()
        .arg("--config")
        .arg(&config)
        .arg("simulate")
        .arg(&path)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Failed to load config"));
}
