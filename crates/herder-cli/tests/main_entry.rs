//! Integration tests for the `herder` binary.

use std::fs;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use assert_cmd::cargo::cargo_bin_cmd;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use predicates::str::contains;
use tempfile::TempDir;

const FAST_SETTINGS: &[(&str, &str)] = &[
    ("HERDER_ALIVE_GRACE_MS", "100"),
    ("HERDER_READINESS_TIMEOUT_MS", "300"),
    ("HERDER_READINESS_RETRY_TIMEOUT_MS", "100"),
    ("HERDER_POLL_INTERVAL_MS", "20"),
    ("HERDER_LOG_FILTER", "warn"),
];

fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    condition()
}

fn pid_in(path: &Path) -> Option<i32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn process_exists(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}

fn spawn_daemon(script: &str) -> Child {
    let mut command = Command::new(env!("CARGO_BIN_EXE_herder"));
    command
        .envs(FAST_SETTINGS.iter().copied())
        .args(["daemon", "--name", "sleeper", "--", "/bin/sh", "-c", script])
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    command.spawn().expect("spawn herder")
}

#[test]
fn run_prints_the_result_envelope() {
    let mut command = cargo_bin_cmd!("herder");
    command
        .envs(FAST_SETTINGS.iter().copied())
        .args(["run", "--prefix", "probe", "--", "/bin/sh", "-c"])
        .arg(r#"printf '{"a": 1}'; exit 3"#);
    command
        .assert()
        .code(3)
        .stdout(contains(r#""exitcode":3"#))
        .stdout(contains(r#""json":{"a":1}"#));
}

#[test]
fn run_times_out_with_failure() {
    let mut command = cargo_bin_cmd!("herder");
    command
        .envs(FAST_SETTINGS.iter().copied())
        .args(["run", "--timeout", "1", "--", "/bin/sh", "-c", "exec sleep 30"]);
    command.assert().failure().stderr(contains("timed out"));
}

#[test]
fn missing_subcommand_is_a_usage_error() {
    let mut command = cargo_bin_cmd!("herder");
    command.assert().failure().stderr(contains("Usage"));
}

#[test]
fn daemon_that_never_starts_exhausts_its_attempts() {
    let mut command = cargo_bin_cmd!("herder");
    command
        .envs(FAST_SETTINGS.iter().copied())
        .env("HERDER_MAX_ATTEMPTS", "2")
        .args(["daemon", "--name", "broken", "--", "/bin/sh", "-c", "exit 7"]);
    command
        .assert()
        .failure()
        .stderr(contains("did not become ready after 2 attempts"));
}

#[test]
fn daemon_exit_ends_supervision_with_failure() {
    let mut command = cargo_bin_cmd!("herder");
    command
        .envs(FAST_SETTINGS.iter().copied())
        .args(["daemon", "--name", "short-lived", "--", "/bin/sh", "-c", "sleep 1"]);
    command
        .timeout(Duration::from_secs(20))
        .assert()
        .failure()
        .stderr(contains("exited while supervised"));
}

#[test]
fn sigterm_stops_the_daemon_and_exits_cleanly() {
    let scratch = TempDir::new().expect("temp dir");
    let pid_file = scratch.path().join("daemon.pid");
    let mut herder = spawn_daemon(&format!("echo $$ > '{}'; exec sleep 30", pid_file.display()));

    assert!(
        wait_until(Duration::from_secs(10), || pid_in(&pid_file).is_some()),
        "daemon never wrote its pid"
    );
    let daemon_pid = pid_in(&pid_file).expect("daemon pid");
    // Give the supervisor time to pass the liveness window.
    thread::sleep(Duration::from_millis(500));

    let herder_pid = i32::try_from(herder.id()).expect("pid fits in i32");
    kill(Pid::from_raw(herder_pid), Signal::SIGTERM).expect("signal herder");
    let status = herder.wait().expect("wait for herder");

    assert!(status.success(), "herder exited with {status}");
    assert!(!process_exists(daemon_pid), "daemon {daemon_pid} outlived herder");
}
