//! One-shot command execution.
//!
//! [`CommandRunner::run`] spawns a command with captured output, drains both
//! pipes on the cooperative scheduler until each reports end-of-file, and
//! returns a [`ShellResult`]. A command that outlives its budget is killed,
//! together with anything it forked, and reported as [`CommandError::Timeout`].

use std::ffi::OsString;
use std::time::Duration;

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use herder_config::{CONFIG_DIR_FLAG, DEFAULT_COMMAND_TIMEOUT_SECS, SupervisorSettings};

use crate::event_loop::EventLoop;
use crate::profiles::CommandProfile;
use crate::readiness::PeerQuery;
use crate::reaper::{self, ReapError};
use crate::result::ShellResult;
use crate::terminal::{OutputMode, ReadOutcome, Terminal, TerminalError, TerminalSpec};

pub(crate) const COMMAND_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::command");

/// Environment variable carrying the caller's log prefix into commands.
pub const LOG_PREFIX_ENV: &str = "HERDER_LOG_PREFIX";

/// Argument that asks a runner-profile command for the joined peers.
pub const JOINED_PEERS_QUERY: &str = "manage.joined";

const CHUNK_SIZE: usize = 4096;
const IDLE_PAUSE: Duration = Duration::from_millis(10);

/// Errors raised by [`CommandRunner`].
#[derive(Debug, Error)]
pub enum CommandError {
    /// The command did not finish within its budget and was killed.
    #[error("'{label}' timed out after {timeout:?}")]
    Timeout {
        /// Display name of the command.
        label: String,
        /// Budget that lapsed.
        timeout: Duration,
    },
    /// Starting, polling, or stopping the process failed.
    #[error(transparent)]
    Terminal(#[from] TerminalError),
    /// A process forked by the command could not be killed.
    #[error(transparent)]
    Reap(#[from] ReapError),
}

/// Runs one kind of command with a fixed script, profile, and log prefix.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    executable: Utf8PathBuf,
    config_dir: Option<Utf8PathBuf>,
    profile: CommandProfile,
    log_prefix: String,
    default_timeout: Duration,
}

impl CommandRunner {
    /// Runner for `bin_dir/<profile script>`.
    #[must_use]
    pub fn new(bin_dir: &Utf8Path, profile: CommandProfile) -> Self {
        let executable = bin_dir.join(profile.script());
        Self::from_executable(executable, profile)
    }

    /// Runner for an explicit executable path.
    #[must_use]
    pub fn from_executable(executable: impl Into<Utf8PathBuf>, profile: CommandProfile) -> Self {
        Self {
            executable: executable.into(),
            config_dir: None,
            log_prefix: profile.script().to_owned(),
            profile,
            default_timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS),
        }
    }

    /// Passes `-c <dir>` to every invocation.
    #[must_use]
    pub fn with_config_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.config_dir = Some(dir.into());
        self
    }

    /// Sets the prefix used in logs and handed to the command.
    #[must_use]
    pub fn with_log_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.log_prefix = prefix.into();
        self
    }

    /// Budget used when a call does not give one.
    #[must_use]
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Takes the default budget from layered settings.
    #[must_use]
    pub fn with_settings(self, settings: &SupervisorSettings) -> Self {
        self.with_default_timeout(settings.command_timeout())
    }

    /// Log prefix.
    #[must_use]
    pub fn log_prefix(&self) -> &str {
        &self.log_prefix
    }

    /// Full argument vector for `args`: script, `-c <dir>`, output flag,
    /// profile arguments, then caller arguments.
    pub fn command_line<S: AsRef<str>>(&self, args: &[S]) -> Vec<OsString> {
        let mut argv = vec![OsString::from(self.executable.as_str())];
        if let Some(dir) = &self.config_dir {
            argv.push(OsString::from(CONFIG_DIR_FLAG));
            argv.push(OsString::from(dir.as_str()));
        }
        if let Some(flag) = self.profile.output_flag() {
            argv.push(OsString::from(flag));
        }
        argv.extend(self.profile.args().iter().map(OsString::from));
        argv.extend(args.iter().map(|arg| OsString::from(arg.as_ref())));
        argv
    }

    /// Runs the command to completion on the current scheduler.
    ///
    /// `timeout` falls back to the runner's default budget. Output is read
    /// until both streams report end-of-file and the process has exited.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Timeout`] after killing a command that outlived
    /// its budget, or [`CommandError::Terminal`] when the process cannot be
    /// started or stopped.
    pub async fn run<S: AsRef<str>>(
        &self,
        args: &[S],
        timeout: Option<Duration>,
    ) -> Result<ShellResult, CommandError> {
        let budget = timeout.unwrap_or(self.default_timeout);
        let argv = self.command_line(args);
        info!(
            target: COMMAND_TARGET,
            prefix = %self.log_prefix,
            command = %display_argv(&argv),
            "running command"
        );
        let spec = TerminalSpec::new(argv, OutputMode::Capture)
            .env(LOG_PREFIX_ENV, format!("[{}] ", self.log_prefix));
        let mut terminal = Terminal::start(&spec)?;
        let deadline = Instant::now() + budget;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut stdout_open = true;
        let mut stderr_open = true;
        while stdout_open || stderr_open {
            tokio::task::yield_now().await;
            let mut progressed = false;
            if stdout_open {
                match terminal.read_stdout(CHUNK_SIZE) {
                    ReadOutcome::Data(bytes) => {
                        stdout.extend(bytes);
                        progressed = true;
                    }
                    ReadOutcome::Pending => {}
                    ReadOutcome::Closed => stdout_open = false,
                }
            }
            if stderr_open {
                match terminal.read_stderr(CHUNK_SIZE) {
                    ReadOutcome::Data(bytes) => {
                        stderr.extend(bytes);
                        progressed = true;
                    }
                    ReadOutcome::Pending => {}
                    ReadOutcome::Closed => stderr_open = false,
                }
            }
            if Instant::now() >= deadline {
                return Err(self.timed_out(&mut terminal, budget));
            }
            if !progressed {
                tokio::time::sleep(IDLE_PAUSE).await;
            }
        }

        let exitcode = loop {
            if let Some(code) = terminal.poll_exit_code()? {
                break code;
            }
            if Instant::now() >= deadline {
                return Err(self.timed_out(&mut terminal, budget));
            }
            tokio::time::sleep(IDLE_PAUSE).await;
        };
        stop_tree(&mut terminal)?;

        let stdout_text = String::from_utf8_lossy(&stdout).into_owned();
        let stderr_text = String::from_utf8_lossy(&stderr).into_owned();
        let payload = self.profile.decoder().decode(&self.log_prefix, &stdout_text);
        debug!(
            target: COMMAND_TARGET,
            prefix = %self.log_prefix,
            exitcode,
            decoded = payload.is_some(),
            "command finished"
        );
        tokio::task::yield_now().await;
        Ok(ShellResult::new(exitcode, stdout_text, stderr_text, payload))
    }

    /// Blocking form of [`CommandRunner::run`] driven by `event_loop`.
    ///
    /// # Errors
    ///
    /// As [`CommandRunner::run`].
    pub fn run_sync<S: AsRef<str>>(
        &self,
        event_loop: &EventLoop,
        args: &[S],
        timeout: Option<Duration>,
    ) -> Result<ShellResult, CommandError> {
        event_loop.block_on(self.run(args, timeout))
    }

    fn timed_out(&self, terminal: &mut Terminal, budget: Duration) -> CommandError {
        warn!(
            target: COMMAND_TARGET,
            prefix = %self.log_prefix,
            pid = terminal.pid(),
            timeout_ms = budget.as_millis(),
            "command timed out; killing it"
        );
        if let Err(error) = stop_tree(terminal) {
            warn!(
                target: COMMAND_TARGET,
                prefix = %self.log_prefix,
                %error,
                "failed to stop timed-out command"
            );
        }
        CommandError::Timeout {
            label: self.log_prefix.clone(),
            timeout: budget,
        }
    }
}

#[async_trait]
impl PeerQuery for CommandRunner {
    async fn joined_peers(&self) -> Result<ShellResult, CommandError> {
        self.run(&[JOINED_PEERS_QUERY], None).await
    }
}

/// Shuts the command down and kills whatever it forked.
fn stop_tree(terminal: &mut Terminal) -> Result<(), CommandError> {
    let descendants = reaper::snapshot_descendants(terminal.pid());
    let stopped = terminal.shutdown();
    let reaped = reaper::reap(&descendants);
    stopped?;
    let report = reaped?;
    if !report.is_clean() {
        warn!(
            target: COMMAND_TARGET,
            pid = terminal.pid(),
            survivors = ?report.survivors(),
            "processes forked by the command survived reaping"
        );
    }
    Ok(())
}

fn display_argv(argv: &[OsString]) -> String {
    argv.iter()
        .map(|arg| arg.to_string_lossy())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use std::fs;

    use serde_json::json;
    use tempfile::TempDir;

    use super::*;

    fn shell(script: &str) -> CommandRunner {
        CommandRunner::from_executable("/bin/sh", CommandProfile::plain("sh").with_args(["-c", script]))
            .with_log_prefix("test-shell")
    }

    #[test]
    fn command_line_orders_flags_before_caller_args() {
        let runner = CommandRunner::new(Utf8Path::new("/opt/bin"), CommandProfile::call("salt-call"))
            .with_config_dir("/tmp/conf");
        let argv: Vec<String> = runner
            .command_line(&["test.ping"])
            .into_iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            argv,
            [
                "/opt/bin/salt-call",
                "-c",
                "/tmp/conf",
                "--out=json",
                "--retcode-passthrough",
                "test.ping"
            ]
        );
    }

    #[tokio::test]
    async fn json_output_is_decoded() {
        let result = shell(r#"printf '{"ok": true}'"#)
            .run(&[] as &[&str], None)
            .await
            .expect("run");
        assert_eq!(result.exitcode(), 0);
        assert!(result == json!({"ok": true}));
    }

    #[tokio::test]
    async fn plain_output_keeps_raw_text_and_exit_code() {
        let result = shell("printf OK; printf warn >&2; exit 4")
            .run(&[] as &[&str], None)
            .await
            .expect("run");
        assert_eq!(result.exitcode(), 4);
        assert!(result == "OK");
        assert_eq!(result.stderr(), "warn");
        assert!(result.payload().is_none());
    }

    #[tokio::test]
    async fn log_prefix_reaches_the_command() {
        let result = shell(&format!("printf %s \"${LOG_PREFIX_ENV}\""))
            .run(&[] as &[&str], None)
            .await
            .expect("run");
        assert_eq!(result.stdout(), "[test-shell] ");
    }

    #[tokio::test]
    async fn timeout_kills_the_command() {
        let dir = TempDir::new().expect("temp dir");
        let pid_file = dir.path().join("pid");
        let script = format!("echo $$ > '{}'; exec sleep 30", pid_file.display());
        let error = shell(&script)
            .run(&[] as &[&str], Some(Duration::from_millis(300)))
            .await
            .expect_err("command must time out");
        assert!(matches!(error, CommandError::Timeout { .. }));

        let pid: u32 = fs::read_to_string(&pid_file)
            .expect("pid file")
            .trim()
            .parse()
            .expect("numeric pid");
        assert!(!reaper::is_alive(pid), "timed-out command {pid} still alive");
    }

    #[tokio::test]
    async fn timeout_kills_forked_workers() {
        let dir = TempDir::new().expect("temp dir");
        let worker_file = dir.path().join("worker");
        let script = format!("sleep 30 & echo $! > '{}'; wait", worker_file.display());
        let error = shell(&script)
            .run(&[] as &[&str], Some(Duration::from_millis(300)))
            .await
            .expect_err("command must time out");
        assert!(matches!(error, CommandError::Timeout { .. }));

        let worker: u32 = fs::read_to_string(&worker_file)
            .expect("worker pid file")
            .trim()
            .parse()
            .expect("numeric pid");
        assert!(!reaper::is_alive(worker), "worker {worker} outlived its command");
    }

    #[test]
    fn blocking_variant_shares_the_algorithm() {
        let event_loop = EventLoop::new().expect("loop");
        let result = shell("printf '[1, 2]'")
            .run_sync(&event_loop, &[] as &[&str], None)
            .expect("run");
        assert!(result == json!([1, 2]));
    }

    #[tokio::test]
    async fn joined_peers_runs_the_query() {
        let runner = CommandRunner::from_executable(
            "/bin/sh",
            CommandProfile::plain("sh").with_args(["-c", r#"printf '["%s"]' "$0""#]),
        );
        let result = runner.joined_peers().await.expect("query");
        assert!(result == json!([JOINED_PEERS_QUERY]));
    }
}
