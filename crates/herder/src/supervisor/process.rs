use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use herder_config::ProcessConfig;

use crate::readiness::{Liveness, PendingChecks, ProbeError, ReadinessProber};
use crate::reaper::{self, ReapError, exit_hook};
use crate::terminal::{OutputMode, Terminal, TerminalError, TerminalSpec};

use super::SUPERVISOR_TARGET;

const ALIVE_POLL: Duration = Duration::from_millis(25);

/// Errors raised while tearing a supervised process down.
#[derive(Debug, Error)]
pub enum TeardownError {
    /// Stopping the daemon itself failed.
    #[error(transparent)]
    Terminal(#[from] TerminalError),
    /// Killing the daemon's descendants failed.
    #[error(transparent)]
    Reap(#[from] ReapError),
}

/// Terminal plus the liveness flag the prober reads.
#[derive(Debug)]
struct Tracked {
    terminal: Terminal,
    alive: bool,
}

impl Liveness for Tracked {
    fn is_alive(&mut self) -> bool {
        if self.alive && !self.terminal.is_running() {
            self.alive = false;
        }
        self.alive
    }
}

/// One spawned daemon process for one attempt.
///
/// Liveness and readiness are separate flags; readiness is only ever set
/// while the process is alive and is reported false once it dies.
#[derive(Debug)]
pub(crate) struct RunningProcess {
    tracked: Tracked,
    ready: bool,
    pending: PendingChecks,
    terminated: bool,
    label: String,
}

impl RunningProcess {
    /// Spawns a fresh process and registers it with the exit-time reaper.
    pub(crate) fn spawn(config: &ProcessConfig, label: &str) -> Result<Self, TerminalError> {
        let terminal = Terminal::start(&TerminalSpec::from_config(config, OutputMode::Inherit))?;
        exit_hook::register(terminal.pid());
        Ok(Self {
            tracked: Tracked {
                terminal,
                alive: true,
            },
            ready: false,
            pending: PendingChecks::from_config(config),
            terminated: false,
            label: label.to_owned(),
        })
    }

    pub(crate) const fn pid(&self) -> u32 {
        self.tracked.terminal.pid()
    }

    pub(crate) fn is_alive(&mut self) -> bool {
        self.tracked.is_alive()
    }

    pub(crate) fn is_ready(&mut self) -> bool {
        self.is_alive() && self.ready
    }

    pub(crate) fn exit_code(&mut self) -> Option<i32> {
        self.tracked.terminal.poll_exit_code().ok().flatten()
    }

    pub(crate) const fn pending(&self) -> &PendingChecks {
        &self.pending
    }

    /// Waits until the process has stayed up for `grace`.
    pub(crate) async fn confirm_alive(&mut self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        loop {
            if !self.tracked.is_alive() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            tokio::time::sleep(ALIVE_POLL.min(deadline - now)).await;
        }
    }

    /// Runs one bounded readiness wait; an elapsed timeout reads as `false`.
    pub(crate) async fn probe(
        &mut self,
        prober: &ReadinessProber<'_>,
        timeout: Duration,
    ) -> Result<bool, ProbeError> {
        let wait = prober.wait(&mut self.pending, &mut self.tracked);
        match tokio::time::timeout(timeout, wait).await {
            Ok(outcome) => outcome,
            Err(_) => {
                debug!(
                    target: SUPERVISOR_TARGET,
                    daemon = %self.label,
                    timeout_ms = timeout.as_millis(),
                    remaining = self.pending.len(),
                    "readiness wait timed out"
                );
                Ok(false)
            }
        }
    }

    /// Marks the process ready if it is still alive.
    pub(crate) fn mark_ready(&mut self) -> bool {
        if self.tracked.is_alive() {
            self.ready = true;
        }
        self.ready
    }

    /// Stops the process and kills anything it left behind. Runs once.
    pub(crate) fn terminate(&mut self) -> Result<(), TeardownError> {
        if self.terminated {
            return Ok(());
        }
        self.terminated = true;
        self.ready = false;
        let pid = self.pid();
        let descendants = reaper::snapshot_descendants(pid);
        let stopped = self.tracked.terminal.shutdown();
        self.tracked.alive = false;
        let reaped = reaper::reap(&descendants);
        exit_hook::unregister(pid);
        debug!(
            target: SUPERVISOR_TARGET,
            daemon = %self.label,
            pid,
            descendants = descendants.len(),
            "process terminated"
        );
        stopped?;
        reaped?;
        Ok(())
    }
}

impl Drop for RunningProcess {
    fn drop(&mut self) {
        if let Err(error) = self.terminate() {
            warn!(
                target: SUPERVISOR_TARGET,
                daemon = %self.label,
                %error,
                "teardown on drop failed"
            );
        }
    }
}
