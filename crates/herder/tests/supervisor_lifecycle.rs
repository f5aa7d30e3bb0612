//! End-to-end supervisor behaviour against real `/bin/sh` daemons.

use std::fs;
use std::net::TcpListener;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use rstest::{fixture, rstest};
use tempfile::TempDir;

use herder::reaper;
use herder::{AttemptFailure, DaemonSupervisor, EventLoop, StartupError, SupervisorState};
use herder_config::{ProcessConfig, ReadinessCheck, SupervisorSettings};

#[fixture]
fn scratch() -> TempDir {
    TempDir::new().expect("temp dir")
}

#[fixture]
fn settings() -> SupervisorSettings {
    SupervisorSettings {
        readiness_timeout_ms: 300,
        readiness_retry_timeout_ms: 150,
        alive_grace_ms: 200,
        poll_interval_ms: 20,
        ..SupervisorSettings::default()
    }
}

fn shell_daemon(name: &str, script: &str) -> ProcessConfig {
    ProcessConfig::builder(name, "/bin/sh")
        .args(["-c", script])
        .build()
        .expect("config")
}

fn read_pids(path: &Path) -> Vec<u32> {
    fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect()
}

fn wait_for_file(path: &Path) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !path.exists() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
}

#[rstest]
#[tokio::test]
async fn daemon_without_checks_is_ready_on_first_attempt(settings: SupervisorSettings) {
    let mut supervisor = DaemonSupervisor::new(shell_daemon("idle", "exec sleep 30"), &settings);
    let mut daemon = supervisor.launch().await.expect("daemon ready");
    assert_eq!(supervisor.state(), SupervisorState::Ready { attempt: 1 });
    assert!(daemon.is_alive());
    assert!(daemon.is_ready());
    daemon.terminate().expect("terminate");
    assert!(!daemon.is_alive());
}

#[rstest]
#[tokio::test]
async fn listening_port_makes_the_daemon_ready(settings: SupervisorSettings) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();
    let config = ProcessConfig::builder("listener", "/bin/sh")
        .args(["-c", "exec sleep 30"])
        .check(ReadinessCheck::port(port))
        .build()
        .expect("config");
    let mut supervisor = DaemonSupervisor::new(config, &settings);
    let mut daemon = supervisor.launch().await.expect("daemon ready");
    assert!(daemon.is_ready());
    daemon.terminate().expect("terminate");
}

#[rstest]
#[tokio::test]
async fn third_attempt_succeeds_after_two_early_exits(
    scratch: TempDir,
    settings: SupervisorSettings,
) {
    let counter = scratch.path().join("attempts");
    let script = format!(
        "n=$(cat '{path}' 2>/dev/null || echo 0); n=$((n + 1)); echo $n > '{path}'; \
         [ \"$n\" -ge 3 ] || exit 1; exec sleep 30",
        path = counter.display()
    );
    let mut supervisor = DaemonSupervisor::new(shell_daemon("flaky", &script), &settings);
    let mut daemon = supervisor.launch().await.expect("third attempt succeeds");
    assert_eq!(supervisor.state(), SupervisorState::Ready { attempt: 3 });
    assert_eq!(fs::read_to_string(&counter).expect("counter").trim(), "3");
    assert!(daemon.is_alive());
    daemon.terminate().expect("terminate");
}

#[rstest]
#[tokio::test]
async fn exhausted_attempts_leave_no_process_behind(
    scratch: TempDir,
    settings: SupervisorSettings,
) {
    let closed_port = {
        let probe = TcpListener::bind("127.0.0.1:0").expect("bind");
        probe.local_addr().expect("addr").port()
    };
    let pids = scratch.path().join("pids");
    let config = ProcessConfig::builder("never-ready", "/bin/sh")
        .args([
            "-c".to_owned(),
            format!("echo $$ >> '{}'; exec sleep 30", pids.display()),
        ])
        .check(ReadinessCheck::port(closed_port))
        .build()
        .expect("config");

    let mut supervisor = DaemonSupervisor::new(config, &settings);
    let error = supervisor.launch().await.expect_err("never ready");
    match error {
        StartupError::Exhausted { attempts, last, .. } => {
            assert_eq!(attempts, 3);
            assert!(matches!(last, AttemptFailure::NotReady { .. }));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(supervisor.state(), SupervisorState::Failed { attempts: 3 });

    let spawned = read_pids(&pids);
    assert_eq!(spawned.len(), 3);
    for pid in spawned {
        assert!(!reaper::is_alive(pid), "attempt pid {pid} still alive");
    }
}

#[rstest]
#[tokio::test]
async fn missing_executable_exhausts_with_spawn_failure(settings: SupervisorSettings) {
    let config = ProcessConfig::builder("ghost", "/nonexistent/herder-daemon")
        .build()
        .expect("config");
    let mut supervisor = DaemonSupervisor::new(config, &settings);
    match supervisor.launch().await {
        Err(StartupError::Exhausted { last, .. }) => {
            assert!(matches!(last, AttemptFailure::Spawn { .. }));
        }
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("a missing executable cannot become ready"),
    }
}

#[rstest]
#[tokio::test]
async fn teardown_reaps_forked_workers(scratch: TempDir, settings: SupervisorSettings) {
    let worker_pid = scratch.path().join("worker.pid");
    let script = format!(
        "sleep 60 & echo $! > '{}'; wait",
        worker_pid.display()
    );
    let mut supervisor = DaemonSupervisor::new(shell_daemon("forking", &script), &settings);
    let mut daemon = supervisor.launch().await.expect("daemon ready");
    wait_for_file(&worker_pid);
    let worker = read_pids(&worker_pid)
        .first()
        .copied()
        .expect("worker pid recorded");
    assert!(reaper::is_alive(worker));

    daemon.terminate().expect("terminate");
    assert!(!reaper::is_alive(worker), "worker {worker} outlived its daemon");
}

#[rstest]
fn blocking_start_shares_the_async_path(settings: SupervisorSettings) {
    let event_loop = EventLoop::new().expect("event loop");
    let mut supervisor = DaemonSupervisor::new(shell_daemon("blocking", "exec sleep 30"), &settings);
    let mut daemon = supervisor.start(&event_loop).expect("daemon ready");
    assert!(daemon.is_ready());
    drop(daemon);
    assert_eq!(supervisor.state(), SupervisorState::Ready { attempt: 1 });
}
