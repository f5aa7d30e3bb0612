//! Bounded retry loop around spawning a daemon and probing its readiness.
//!
//! Each attempt spawns a fresh process, waits for it to survive a short
//! liveness window, then probes readiness twice: once with the primary budget
//! and, if that lapses, once more with the shorter retry budget. A failed
//! attempt is torn down completely before the next one starts. When every
//! attempt fails the caller receives [`StartupError::Exhausted`] and no
//! process is left running.

mod process;
mod state;

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use herder_config::{ProcessConfig, SupervisorSettings};

use crate::event_loop::EventLoop;
use crate::readiness::{PeerQuery, ProbeError, ReadinessProber};

use self::process::RunningProcess;
pub use self::process::TeardownError;
pub use self::state::SupervisorState;

pub(crate) const SUPERVISOR_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::supervisor");

/// Why a single attempt did not produce a ready daemon.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttemptFailure {
    /// The process could not be started.
    #[error("spawn failed: {reason}")]
    Spawn {
        /// Rendered spawn error.
        reason: String,
    },
    /// The process exited before or while it was being probed.
    #[error("process exited early (exit code {exit_code:?})")]
    Died {
        /// Exit code, when one was observed.
        exit_code: Option<i32>,
    },
    /// Both readiness budgets lapsed with checks still pending.
    #[error("readiness checks still pending: {pending}")]
    NotReady {
        /// Comma-separated pending checks.
        pending: String,
    },
    /// The prober refused to run.
    #[error("readiness probe failed: {reason}")]
    Probe {
        /// Rendered probe error.
        reason: String,
    },
}

/// Errors surfaced by [`DaemonSupervisor::launch`].
#[derive(Debug, Error)]
pub enum StartupError {
    /// Every attempt failed; the daemon could not be started.
    #[error("'{name}' did not become ready after {attempts} attempts; last failure: {last}")]
    Exhausted {
        /// Display name of the daemon.
        name: String,
        /// Attempts made.
        attempts: u32,
        /// Failure of the final attempt.
        last: AttemptFailure,
    },
    /// A failed attempt could not be torn down.
    #[error("failed to tear down '{name}' after attempt {attempt}: {source}")]
    Teardown {
        /// Display name of the daemon.
        name: String,
        /// Attempt being torn down.
        attempt: u32,
        /// Underlying teardown error.
        #[source]
        source: TeardownError,
    },
}

enum AttemptError {
    Failed(AttemptFailure),
    Teardown(TeardownError),
}

/// Launches one daemon with bounded retries.
pub struct DaemonSupervisor<'p> {
    config: ProcessConfig,
    max_attempts: u32,
    readiness_timeout: Duration,
    readiness_retry_timeout: Duration,
    alive_grace: Duration,
    poll_interval: Duration,
    log_prefix: String,
    peers: Option<&'p dyn PeerQuery>,
    state: SupervisorState,
}

impl<'p> DaemonSupervisor<'p> {
    /// Supervisor for `config` using the budgets in `settings`.
    #[must_use]
    pub fn new(config: ProcessConfig, settings: &SupervisorSettings) -> Self {
        let log_prefix = config.name().to_owned();
        Self {
            config,
            max_attempts: settings.attempts(),
            readiness_timeout: settings.readiness_timeout(),
            readiness_retry_timeout: settings.readiness_retry_timeout(),
            alive_grace: settings.alive_grace(),
            poll_interval: settings.poll_interval(),
            log_prefix,
            peers: None,
            state: SupervisorState::NotStarted,
        }
    }

    /// Overrides the prefix used in log lines; defaults to the config name.
    #[must_use]
    pub fn with_log_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.log_prefix = prefix.into();
        self
    }

    /// Supplies the collaborator that answers peer readiness checks.
    #[must_use]
    pub fn with_peer_query(mut self, peers: &'p dyn PeerQuery) -> Self {
        self.peers = Some(peers);
        self
    }

    /// Current launch state.
    #[must_use]
    pub const fn state(&self) -> SupervisorState {
        self.state
    }

    /// Supervised configuration.
    #[must_use]
    pub const fn config(&self) -> &ProcessConfig {
        &self.config
    }

    /// Starts the daemon on `event_loop`, blocking until it is ready or every
    /// attempt has failed.
    ///
    /// # Errors
    ///
    /// As [`DaemonSupervisor::launch`].
    pub fn start(&mut self, event_loop: &EventLoop) -> Result<RunningDaemon, StartupError> {
        event_loop.block_on(self.launch())
    }

    /// Starts the daemon, retrying up to the configured number of attempts.
    ///
    /// The returned handle is alive and ready. No handle is returned on
    /// failure and every process spawned along the way has been stopped.
    ///
    /// # Errors
    ///
    /// Returns [`StartupError::Exhausted`] when no attempt succeeded and
    /// [`StartupError::Teardown`] when a failed attempt could not be stopped.
    pub async fn launch(&mut self) -> Result<RunningDaemon, StartupError> {
        self.state = SupervisorState::NotStarted;
        let mut last_failure = None;
        for attempt in 1..=self.max_attempts {
            self.advance(SupervisorState::Spawning { attempt });
            info!(
                target: SUPERVISOR_TARGET,
                daemon = %self.log_prefix,
                attempt,
                max_attempts = self.max_attempts,
                "starting daemon"
            );
            match self.attempt(attempt).await {
                Ok(process) => {
                    self.advance(SupervisorState::Ready { attempt });
                    info!(
                        target: SUPERVISOR_TARGET,
                        daemon = %self.log_prefix,
                        attempt,
                        pid = process.pid(),
                        "daemon is ready"
                    );
                    return Ok(RunningDaemon {
                        process,
                        config: self.config.clone(),
                    });
                }
                Err(AttemptError::Failed(failure)) => {
                    warn!(
                        target: SUPERVISOR_TARGET,
                        daemon = %self.log_prefix,
                        attempt,
                        %failure,
                        "attempt failed"
                    );
                    last_failure = Some(failure);
                }
                Err(AttemptError::Teardown(source)) => {
                    self.advance(SupervisorState::Failed { attempts: attempt });
                    return Err(StartupError::Teardown {
                        name: self.config.name().to_owned(),
                        attempt,
                        source,
                    });
                }
            }
        }

        self.advance(SupervisorState::Failed {
            attempts: self.max_attempts,
        });
        let last = last_failure.unwrap_or(AttemptFailure::Died { exit_code: None });
        error!(
            target: SUPERVISOR_TARGET,
            daemon = %self.log_prefix,
            attempts = self.max_attempts,
            %last,
            "daemon could not be started"
        );
        Err(StartupError::Exhausted {
            name: self.config.name().to_owned(),
            attempts: self.max_attempts,
            last,
        })
    }

    async fn attempt(&mut self, attempt: u32) -> Result<RunningProcess, AttemptError> {
        let mut process = RunningProcess::spawn(&self.config, &self.log_prefix).map_err(|error| {
            AttemptError::Failed(AttemptFailure::Spawn {
                reason: error.to_string(),
            })
        })?;

        if !process.confirm_alive(self.alive_grace).await {
            let exit_code = process.exit_code();
            process.terminate().map_err(AttemptError::Teardown)?;
            return Err(AttemptError::Failed(AttemptFailure::Died { exit_code }));
        }
        self.advance(SupervisorState::AliveUnconfirmed { attempt });

        let failure = match self.await_ready(&mut process).await {
            Ok(true) if process.mark_ready() => {
                // Let other scheduled work run before handing the daemon over.
                tokio::task::yield_now().await;
                return Ok(process);
            }
            Ok(_) if !process.is_alive() => AttemptFailure::Died {
                exit_code: process.exit_code(),
            },
            Ok(_) => AttemptFailure::NotReady {
                pending: process
                    .pending()
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", "),
            },
            Err(probe_error) => {
                error!(
                    target: SUPERVISOR_TARGET,
                    daemon = %self.log_prefix,
                    attempt,
                    error = %probe_error,
                    "readiness probe failed"
                );
                AttemptFailure::Probe {
                    reason: probe_error.to_string(),
                }
            }
        };
        process.terminate().map_err(AttemptError::Teardown)?;
        Err(AttemptError::Failed(failure))
    }

    async fn await_ready(
        &self,
        process: &mut RunningProcess,
    ) -> Result<bool, ProbeError> {
        let mut prober = ReadinessProber::new(&self.log_prefix, self.poll_interval);
        if let Some(peers) = self.peers {
            prober = prober.with_peer_query(peers);
        }
        if process.probe(&prober, self.readiness_timeout).await? {
            return Ok(true);
        }
        if !process.is_alive() {
            return Ok(false);
        }
        debug!(
            target: SUPERVISOR_TARGET,
            daemon = %self.log_prefix,
            timeout_ms = self.readiness_retry_timeout.as_millis(),
            "not ready yet; probing once more"
        );
        process.probe(&prober, self.readiness_retry_timeout).await
    }

    fn advance(&mut self, next: SupervisorState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal supervisor transition {} -> {}",
            self.state,
            next
        );
        debug!(
            target: SUPERVISOR_TARGET,
            daemon = %self.log_prefix,
            from = %self.state,
            to = %next,
            "state change"
        );
        self.state = next;
    }
}

/// Handle to a daemon that is alive and ready.
///
/// Dropping the handle terminates the daemon.
#[derive(Debug)]
pub struct RunningDaemon {
    process: RunningProcess,
    config: ProcessConfig,
}

impl RunningDaemon {
    /// OS process id of the daemon.
    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.process.pid()
    }

    /// Display name of the daemon.
    #[must_use]
    pub fn name(&self) -> &str {
        self.config.name()
    }

    /// Configuration the daemon was launched with.
    #[must_use]
    pub const fn config(&self) -> &ProcessConfig {
        &self.config
    }

    /// Whether the daemon process is still running.
    pub fn is_alive(&mut self) -> bool {
        self.process.is_alive()
    }

    /// Whether the daemon is ready; never true once it has died.
    pub fn is_ready(&mut self) -> bool {
        self.process.is_ready()
    }

    /// Stops the daemon and reaps its descendants. Later calls do nothing.
    ///
    /// # Errors
    ///
    /// Returns [`TeardownError`] when the daemon or one of its descendants
    /// could not be signalled.
    pub fn terminate(&mut self) -> Result<(), TeardownError> {
        self.process.terminate()
    }
}
