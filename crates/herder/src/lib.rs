//! Process supervision for test harnesses.
//!
//! `herder` launches long-running daemons and short-lived commands as OS
//! subprocesses and keeps them on a short leash:
//!
//! - [`terminal`] owns one subprocess, its pipes, and an escalating shutdown.
//! - [`reaper`] kills descendants a daemon leaves behind, both at teardown and
//!   from an `atexit` safety net.
//! - [`readiness`] polls declared checks until a daemon can serve requests.
//! - [`supervisor`] wraps spawn and readiness in a bounded retry loop.
//! - [`command`] runs one-shot invocations and decodes their output into a
//!   [`ShellResult`].
//!
//! All waiting happens on a single-threaded cooperative scheduler, the
//! [`EventLoop`], so several daemons can be probed in the same scope without a
//! thread per daemon.

pub mod command;
pub mod event_loop;
pub mod profiles;
pub mod readiness;
pub mod reaper;
pub mod result;
pub mod supervisor;
pub mod telemetry;
pub mod terminal;

pub use command::{CommandError, CommandRunner, JOINED_PEERS_QUERY, LOG_PREFIX_ENV};
pub use event_loop::{CurrentLoopGuard, EventLoop};
pub use profiles::{CommandProfile, DaemonProfile, JSON_OUTPUT_FLAG, OutputDecoder, ProfileError};
pub use readiness::{Liveness, PeerQuery, PendingChecks, ProbeError, ReadinessProber};
pub use reaper::{Descendant, ReapError, ReapReport, reap, reap_descendants, snapshot_descendants};
pub use result::ShellResult;
pub use supervisor::{
    AttemptFailure, DaemonSupervisor, RunningDaemon, StartupError, SupervisorState, TeardownError,
};
pub use telemetry::{TelemetryError, TelemetryHandle};
pub use terminal::{OutputMode, ReadOutcome, Terminal, TerminalError, TerminalSpec};
