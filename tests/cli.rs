use assert_cmd::Command;
use predicates::prelude::*;

fn fcctl(state: &tempfile::TempDir) -> Command {
    let mut cmd = Command::cargo_bin("fcctl").unwrap();
    // Keep the user's config and FCCTL_* settings out of the tests
    cmd.env("HOME", state.path())
        .env("XDG_CONFIG_HOME", state.path())
        .env_remove("RUST_LOG")
        .env_remove("FCCTL_SOCKET")
        .env_remove("FCCTL_TAP")
        .env_remove("FCCTL_STATE_DIR")
        .env_remove("FCCTL_LOG_LEVEL")
        .env_remove("FCCTL_LOG_FORMAT")
        .arg("--state-dir")
        .arg(state.path().join("state"));
    cmd
}

#[test]
fn test_cli_version() {
    let mut cmd = Command::cargo_bin("fcctl").unwrap();
    cmd.arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("fcctl 0.1.0"));
}

#[test]
fn test_cli_help() {
    let mut cmd = Command::cargo_bin("fcctl").unwrap();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "Set up, start and tear down a Firecracker MicroVM",
        ))
        .stdout(predicate::str::contains("teardown"));
}

#[test]
fn test_cli_unknown_command() {
    let mut cmd = Command::cargo_bin("fcctl").unwrap();
    cmd.arg("reboot").assert().failure();
}

#[test]
fn test_cli_dry_run_net_up() {
    let state = tempfile::tempdir().unwrap();
    fcctl(&state)
        .args(["--dry-run", "--tap", "tap9", "net-up"])
        .assert()
        .success()
        .stderr(predicate::str::contains("Would run: ip tuntap add tap9 mode tap"))
        .stderr(predicate::str::contains(
            "Would run: iptables -A FORWARD -j FIRECRACKER-FORWARD",
        ));
}

#[test]
fn test_cli_dry_run_teardown_touches_nothing() {
    let state = tempfile::tempdir().unwrap();
    let socket = state.path().join("api.socket");
    std::fs::write(&socket, b"").unwrap();

    fcctl(&state)
        .arg("--dry-run")
        .arg("--socket")
        .arg(&socket)
        .arg("teardown")
        .assert()
        .success()
        .stderr(predicate::str::contains("Would run: ip link delete tap0"));

    assert!(socket.exists());
}

#[test]
fn test_cli_guest_script_stdout() {
    let state = tempfile::tempdir().unwrap();
    fcctl(&state)
        .args(["--guest-ip", "10.0.0.2", "--host-ip", "10.0.0.1", "guest-script"])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("#!/bin/sh"))
        .stdout(predicate::str::contains("ip addr add 10.0.0.2/24 dev eth0"))
        .stdout(predicate::str::contains("ip route add default via 10.0.0.1"));
}

#[test]
fn test_cli_guest_script_output_file() {
    let state = tempfile::tempdir().unwrap();
    let out = state.path().join("net-setup.sh");

    fcctl(&state)
        .arg("guest-script")
        .arg("--output")
        .arg(&out)
        .assert()
        .success();

    let script = std::fs::read_to_string(&out).unwrap();
    assert!(script.contains("nameserver 8.8.8.8"));
}

#[test]
fn test_cli_start_with_invalid_config_fails() {
    let state = tempfile::tempdir().unwrap();
    let config = state.path().join("vm-config.json");
    std::fs::write(&config, "{ not json").unwrap();

    fcctl(&state)
        .arg("--dry-run")
        .arg("--socket")
        .arg(state.path().join("api.socket"))
        .arg("start")
        .arg("--config-file")
        .arg(&config)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid JSON in config file"));
}

#[test]
fn test_cli_rejects_same_host_and_guest_address() {
    let state = tempfile::tempdir().unwrap();
    fcctl(&state)
        .args(["--host-ip", "10.0.0.1", "--guest-ip", "10.0.0.1", "guest-script"])
        .assert()
        .failure();
}
