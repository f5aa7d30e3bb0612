//! One subprocess, its pipes, and an escalating shutdown sequence.
//!
//! A [`Terminal`] is started once and never restarted. Daemons run with
//! inherited stdio ([`OutputMode::Inherit`]); one-shot commands capture both
//! streams through non-blocking pipes ([`OutputMode::Capture`]) which are read
//! with [`Terminal::read_stdout`] and [`Terminal::read_stderr`] without ever
//! blocking the scheduler.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::io::{self, Read};
use std::os::fd::AsRawFd;
use std::os::unix::process::ExitStatusExt;
use std::process::{Child, ChildStderr, ChildStdout, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use nix::errno::Errno;
use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use thiserror::Error;
use tracing::{debug, warn};

use herder_config::ProcessConfig;

pub(crate) const TERMINAL_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::terminal");

const SHUTDOWN_POLL: Duration = Duration::from_micros(12_500);
const SHUTDOWN_BUDGET: Duration = Duration::from_secs(5);

/// How the child's standard streams are wired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Share our stdout and stderr. Used for daemons.
    Inherit,
    /// Capture stdout and stderr through non-blocking pipes.
    Capture,
}

/// Everything needed to spawn a [`Terminal`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalSpec {
    argv: Vec<OsString>,
    env: BTreeMap<OsString, OsString>,
    working_dir: Option<Utf8PathBuf>,
    mode: OutputMode,
}

impl TerminalSpec {
    /// Describes a process from its argument vector, program first.
    #[must_use]
    pub fn new<I, S>(argv: I, mode: OutputMode) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            env: BTreeMap::new(),
            working_dir: None,
            mode,
        }
    }

    /// Describes the process a [`ProcessConfig`] launches.
    #[must_use]
    pub fn from_config(config: &ProcessConfig, mode: OutputMode) -> Self {
        let mut spec = Self::new(config.command_line(), mode);
        for (key, value) in config.env() {
            spec.env.insert(key.into(), value.into());
        }
        spec.working_dir = config.working_dir().map(Into::into);
        spec
    }

    /// Adds an environment override on top of the inherited environment.
    #[must_use]
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Runs the process from `dir`.
    #[must_use]
    pub fn working_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Argument vector, program first.
    #[must_use]
    pub fn argv(&self) -> &[OsString] {
        &self.argv
    }

    /// Stream wiring.
    #[must_use]
    pub const fn mode(&self) -> OutputMode {
        self.mode
    }

    fn program_display(&self) -> String {
        self.argv
            .first()
            .map(|program| program.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    fn command(&self) -> Result<Command, TerminalError> {
        let (program, rest) = self.argv.split_first().ok_or(TerminalError::EmptyCommand)?;
        let mut command = Command::new(program);
        command.args(rest).envs(&self.env).stdin(Stdio::null());
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir.as_std_path());
        }
        match self.mode {
            OutputMode::Inherit => {
                command.stdout(Stdio::inherit()).stderr(Stdio::inherit());
            }
            OutputMode::Capture => {
                command.stdout(Stdio::piped()).stderr(Stdio::piped());
            }
        }
        Ok(command)
    }
}

/// Result of one non-blocking pipe read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Bytes that were available right now.
    Data(Vec<u8>),
    /// Nothing available yet; the writer may still produce more.
    Pending,
    /// The stream reached end-of-file or was never captured.
    Closed,
}

/// Errors raised by [`Terminal`].
#[derive(Debug, Error)]
pub enum TerminalError {
    /// The argument vector was empty.
    #[error("cannot start a process without a program")]
    EmptyCommand,
    /// The OS refused to start the program.
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// Switching a pipe to non-blocking mode failed.
    #[error("failed to configure output pipe of pid {pid}: {source}")]
    Pipe {
        /// Child process id.
        pid: u32,
        /// Underlying errno.
        #[source]
        source: Errno,
    },
    /// Waiting on the child failed.
    #[error("failed to wait for pid {pid}: {source}")]
    Wait {
        /// Child process id.
        pid: u32,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// Delivering a signal failed with something other than a vanished process
    /// or a permission refusal.
    #[error("failed to send {signal} to pid {pid}: {source}")]
    Signal {
        /// Target process id.
        pid: u32,
        /// Signal that was sent.
        signal: Signal,
        /// Underlying errno.
        #[source]
        source: Errno,
    },
    /// The final forced kill failed.
    #[error("failed to force-kill pid {pid}: {source}")]
    ForceKill {
        /// Target process id.
        pid: u32,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
}

/// Owned handle to one running subprocess.
#[derive(Debug)]
pub struct Terminal {
    child: Child,
    pid: u32,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    exit_code: Option<i32>,
    closed: bool,
}

impl Terminal {
    /// Spawns the described process.
    ///
    /// # Errors
    ///
    /// Returns [`TerminalError::Spawn`] when the program cannot be started and
    /// [`TerminalError::Pipe`] when captured pipes cannot be made
    /// non-blocking. In the latter case the child is killed before returning.
    pub fn start(spec: &TerminalSpec) -> Result<Self, TerminalError> {
        let mut command = spec.command()?;
        let mut child = command.spawn().map_err(|source| TerminalError::Spawn {
            program: spec.program_display(),
            source,
        })?;
        let pid = child.id();
        let terminal = Self {
            stdout: child.stdout.take(),
            stderr: child.stderr.take(),
            child,
            pid,
            exit_code: None,
            closed: false,
        };
        terminal.configure_pipes()?;
        debug!(
            target: TERMINAL_TARGET,
            pid,
            program = %spec.program_display(),
            mode = ?spec.mode(),
            "process started"
        );
        Ok(terminal)
    }

    fn configure_pipes(&self) -> Result<(), TerminalError> {
        if let Some(stdout) = &self.stdout {
            set_nonblocking(stdout).map_err(|source| TerminalError::Pipe {
                pid: self.pid,
                source,
            })?;
        }
        if let Some(stderr) = &self.stderr {
            set_nonblocking(stderr).map_err(|source| TerminalError::Pipe {
                pid: self.pid,
                source,
            })?;
        }
        Ok(())
    }

    /// OS process id.
    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    /// Returns the exit code once the process has exited, without blocking.
    ///
    /// A process killed by a signal reports `128 + signo`.
    ///
    /// # Errors
    ///
    /// Returns [`TerminalError::Wait`] when the OS cannot report the status.
    pub fn poll_exit_code(&mut self) -> Result<Option<i32>, TerminalError> {
        if self.exit_code.is_some() {
            return Ok(self.exit_code);
        }
        let status = self.child.try_wait().map_err(|source| TerminalError::Wait {
            pid: self.pid,
            source,
        })?;
        if let Some(exit) = status {
            self.exit_code = Some(exit_code(exit));
        }
        Ok(self.exit_code)
    }

    /// Whether the process has not exited yet.
    ///
    /// A status query failure counts as not running.
    pub fn is_running(&mut self) -> bool {
        matches!(self.poll_exit_code(), Ok(None))
    }

    /// Reads up to `max_bytes` currently available on stdout.
    pub fn read_stdout(&mut self, max_bytes: usize) -> ReadOutcome {
        read_pipe(&mut self.stdout, max_bytes, self.pid, "stdout")
    }

    /// Reads up to `max_bytes` currently available on stderr.
    pub fn read_stderr(&mut self, max_bytes: usize) -> ReadOutcome {
        read_pipe(&mut self.stderr, max_bytes, self.pid, "stderr")
    }

    /// Whether [`Terminal::shutdown`] has completed.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    /// Kills the process, reaps it, and closes its pipes.
    ///
    /// The sequence is SIGKILL, a bounded wait, a forced kill if the process
    /// still lingers, SIGTERM while the pid is still ours, and a final
    /// blocking wait. Calling this again after it succeeded does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`TerminalError`] for signal or wait failures other than a
    /// vanished process or a permission refusal.
    pub fn shutdown(&mut self) -> Result<(), TerminalError> {
        if self.closed {
            return Ok(());
        }
        if self.is_running() {
            self.signal(Signal::SIGKILL)?;
            let deadline = Instant::now() + SHUTDOWN_BUDGET;
            while self.is_running() && Instant::now() < deadline {
                thread::sleep(SHUTDOWN_POLL);
            }
            if self.is_running() {
                warn!(
                    target: TERMINAL_TARGET,
                    pid = self.pid,
                    "process survived SIGKILL; forcing"
                );
                self.child.kill().map_err(|source| TerminalError::ForceKill {
                    pid: self.pid,
                    source,
                })?;
            }
        }
        // Once reaped the pid may be recycled, so only signal an unreaped child.
        if self.exit_code.is_none() {
            self.signal(Signal::SIGTERM)?;
        }
        let status = self.child.wait().map_err(|source| TerminalError::Wait {
            pid: self.pid,
            source,
        })?;
        self.exit_code.get_or_insert(exit_code(status));
        self.stdout = None;
        self.stderr = None;
        self.closed = true;
        debug!(
            target: TERMINAL_TARGET,
            pid = self.pid,
            exit_code = self.exit_code,
            "process shut down"
        );
        Ok(())
    }

    fn signal(&self, signal: Signal) -> Result<(), TerminalError> {
        let Some(pid) = nix_pid(self.pid) else {
            return Ok(());
        };
        match kill(pid, signal) {
            Ok(()) => Ok(()),
            Err(errno @ (Errno::ESRCH | Errno::EPERM | Errno::EACCES)) => {
                debug!(
                    target: TERMINAL_TARGET,
                    pid = self.pid,
                    %signal,
                    %errno,
                    "signal not delivered"
                );
                Ok(())
            }
            Err(source) => Err(TerminalError::Signal {
                pid: self.pid,
                signal,
                source,
            }),
        }
    }
}

impl Drop for Terminal {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(error) = self.child.kill() {
            debug!(target: TERMINAL_TARGET, pid = self.pid, %error, "kill on drop failed");
        }
        if let Err(error) = self.child.wait() {
            debug!(target: TERMINAL_TARGET, pid = self.pid, %error, "wait on drop failed");
        }
    }
}

/// Converts an OS process id into the signed form `nix` expects.
pub(crate) fn nix_pid(pid: u32) -> Option<Pid> {
    i32::try_from(pid).ok().map(Pid::from_raw)
}

fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| status.signal().map_or(-1, |signo| 128 + signo))
}

fn set_nonblocking(pipe: &impl AsRawFd) -> Result<(), Errno> {
    let fd = pipe.as_raw_fd();
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

fn read_pipe<R: Read>(
    pipe: &mut Option<R>,
    max_bytes: usize,
    pid: u32,
    stream: &'static str,
) -> ReadOutcome {
    let Some(reader) = pipe.as_mut() else {
        return ReadOutcome::Closed;
    };
    let mut buffer = vec![0_u8; max_bytes.max(1)];
    match reader.read(&mut buffer) {
        Ok(0) => {
            *pipe = None;
            ReadOutcome::Closed
        }
        Ok(read) => {
            buffer.truncate(read);
            ReadOutcome::Data(buffer)
        }
        Err(error)
            if matches!(
                error.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
            ) =>
        {
            ReadOutcome::Pending
        }
        Err(error) => {
            debug!(
                target: TERMINAL_TARGET,
                pid,
                stream,
                %error,
                "pipe read failed; treating stream as closed"
            );
            *pipe = None;
            ReadOutcome::Closed
        }
    }
}
