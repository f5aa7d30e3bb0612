//! `herder daemon`: supervise one daemon until shutdown.

use std::io;
use std::thread;

use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::Signals;
use thiserror::Error;
use tracing::{info, warn};

use herder::{DaemonSupervisor, EventLoop, RunningDaemon, StartupError, TeardownError};
use herder_config::{ProcessConfig, ProcessConfigError, ReadinessCheck, SupervisorSettings};

use crate::cli::DaemonArgs;

const CLI_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::daemon");

/// Why supervision ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stop {
    /// A termination signal arrived.
    Signal(i32),
    /// The daemon exited on its own.
    DaemonExited,
}

#[derive(Debug, Error)]
pub(crate) enum DaemonError {
    #[error("failed to install signal handlers: {0}")]
    Signals(#[source] io::Error),
    #[error("failed to create the event loop: {0}")]
    EventLoop(#[source] io::Error),
    #[error(transparent)]
    Config(#[from] ProcessConfigError),
    #[error(transparent)]
    Startup(#[from] StartupError),
    #[error(transparent)]
    Teardown(#[from] TeardownError),
    #[error("daemon '{name}' exited while supervised")]
    Exited { name: String },
}

pub(crate) fn build_config(args: &DaemonArgs) -> Result<ProcessConfig, DaemonError> {
    let (executable, rest) = args
        .command
        .split_first()
        .map_or(("", &[][..]), |(first, rest)| (first.as_str(), rest));
    let mut builder = ProcessConfig::builder(args.name.as_str(), executable)
        .args(rest.iter().cloned())
        .checks(args.ports.iter().copied().map(ReadinessCheck::port));
    if let Some(dir) = &args.config_dir {
        builder = builder.config_dir(dir.clone());
    }
    Ok(builder.build()?)
}

/// Starts the daemon and blocks until a signal arrives or the daemon dies.
pub(crate) fn supervise(
    args: &DaemonArgs,
    settings: &SupervisorSettings,
) -> Result<Stop, DaemonError> {
    let config = build_config(args)?;
    // Registered before the daemon starts so an early signal is not lost.
    let mut signals =
        Signals::new([SIGTERM, SIGINT, SIGQUIT, SIGHUP]).map_err(DaemonError::Signals)?;
    let event_loop = EventLoop::new().map_err(DaemonError::EventLoop)?;
    let mut supervisor = DaemonSupervisor::new(config, settings);
    let mut daemon = supervisor.start(&event_loop)?;
    info!(
        target: CLI_TARGET,
        daemon = daemon.name(),
        pid = daemon.pid(),
        "supervising daemon"
    );

    let stop = wait_for_stop(&mut signals, &mut daemon, settings);
    match stop {
        Stop::Signal(signal) => {
            info!(target: CLI_TARGET, signal, "shutdown signal received");
            daemon.terminate()?;
            Ok(stop)
        }
        Stop::DaemonExited => {
            warn!(target: CLI_TARGET, daemon = daemon.name(), "daemon exited");
            let name = daemon.name().to_owned();
            daemon.terminate()?;
            Err(DaemonError::Exited { name })
        }
    }
}

fn wait_for_stop(
    signals: &mut Signals,
    daemon: &mut RunningDaemon,
    settings: &SupervisorSettings,
) -> Stop {
    loop {
        if let Some(signal) = signals.pending().next() {
            return Stop::Signal(signal);
        }
        if !daemon.is_alive() {
            return Stop::DaemonExited;
        }
        thread::sleep(settings.poll_interval());
    }
}
