//! Ready-made argument and readiness layouts for the usual cast of processes.
//!
//! A test harness typically runs a coordinator daemon, one or more worker
//! daemons that join it, an optional SSH server, and a handful of
//! administrative commands. The profiles here capture the arguments each of
//! them needs so callers only supply paths, ports, and ids.

use std::env;
use std::ffi::OsStr;
use std::os::unix::fs::PermissionsExt;

use camino::{Utf8Path, Utf8PathBuf};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use herder_config::{ProcessConfig, ProcessConfigError, ReadinessCheck};

pub(crate) const PROFILES_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::profiles");

/// Output flag every structured-output command understands.
pub const JSON_OUTPUT_FLAG: &str = "--out=json";

/// How a command's stdout turns into a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputDecoder {
    /// Parse stdout as one JSON document.
    Json,
    /// Parse stdout as a JSON object and keep the value under one key.
    JsonField(String),
    /// Never decode; the payload is always absent.
    Raw,
}

impl OutputDecoder {
    /// Decodes `stdout`; blank or malformed output yields `None`.
    #[must_use]
    pub fn decode(&self, label: &str, stdout: &str) -> Option<Value> {
        let text = stdout.trim();
        if text.is_empty() || matches!(self, Self::Raw) {
            return None;
        }
        let document = match serde_json::from_str::<Value>(text) {
            Ok(document) => document,
            Err(error) => {
                debug!(
                    target: PROFILES_TARGET,
                    command = label,
                    %error,
                    output = text,
                    "output is not JSON"
                );
                return None;
            }
        };
        match self {
            Self::JsonField(key) => {
                let field = document.get(key).cloned();
                if field.is_none() {
                    debug!(
                        target: PROFILES_TARGET,
                        command = label,
                        key = key.as_str(),
                        "decoded output lacks the expected key"
                    );
                }
                field
            }
            Self::Json | Self::Raw => Some(document),
        }
    }
}

/// Arguments and decoding for one kind of one-shot command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandProfile {
    script: String,
    output_flag: Option<String>,
    args: Vec<String>,
    decoder: OutputDecoder,
}

impl CommandProfile {
    /// Structured-output command with no extra arguments.
    #[must_use]
    pub fn control(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            output_flag: Some(JSON_OUTPUT_FLAG.to_owned()),
            args: Vec::new(),
            decoder: OutputDecoder::Json,
        }
    }

    /// Local execution command; its exit code mirrors the executed job.
    #[must_use]
    pub fn call(script: impl Into<String>) -> Self {
        Self::control(script).with_args(["--retcode-passthrough"])
    }

    /// Key management command.
    #[must_use]
    pub fn keys(script: impl Into<String>) -> Self {
        Self::control(script)
    }

    /// Coordinator-side runner; answers the joined-peers query.
    #[must_use]
    pub fn runner(script: impl Into<String>) -> Self {
        Self::control(script)
    }

    /// Agentless execution against `localhost` over SSH.
    ///
    /// The roster lives in `config_dir` and the decoded payload is the entry
    /// for `localhost`.
    #[must_use]
    pub fn ssh(script: impl Into<String>, config_dir: &Utf8Path) -> Self {
        Self::control(script)
            .with_args([
                "-l".to_owned(),
                "trace".to_owned(),
                "-w".to_owned(),
                "--rand-thin-dir".to_owned(),
                format!("--roster-file={}", config_dir.join("roster")),
                "--ignore-host-keys".to_owned(),
                "localhost".to_owned(),
            ])
            .with_decoder(OutputDecoder::JsonField("localhost".to_owned()))
    }

    /// Arbitrary program: no output flag, best-effort JSON decoding.
    #[must_use]
    pub fn plain(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            output_flag: None,
            args: Vec::new(),
            decoder: OutputDecoder::Json,
        }
    }

    /// Appends profile arguments, placed before caller arguments.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Replaces the decoder.
    #[must_use]
    pub fn with_decoder(mut self, decoder: OutputDecoder) -> Self {
        self.decoder = decoder;
        self
    }

    /// Script file name, resolved against a binary directory.
    #[must_use]
    pub fn script(&self) -> &str {
        &self.script
    }

    /// Machine-readable output flag, if the command takes one.
    #[must_use]
    pub fn output_flag(&self) -> Option<&str> {
        self.output_flag.as_deref()
    }

    /// Profile arguments.
    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Output decoder.
    #[must_use]
    pub const fn decoder(&self) -> &OutputDecoder {
        &self.decoder
    }
}

/// Errors raised while turning a profile into a [`ProcessConfig`].
#[derive(Debug, Error)]
pub enum ProfileError {
    /// The program was not found on `PATH`.
    #[error("'{program}' was not found on PATH")]
    ExecutableNotFound {
        /// Program name that was searched for.
        program: String,
    },
    /// A worker's coordinator lacks a location the worker inherits.
    #[error("coordinator '{coordinator}' has no {missing} to inherit")]
    MissingLocation {
        /// Coordinator display name.
        coordinator: String,
        /// What was missing.
        missing: &'static str,
    },
    /// The resulting configuration was invalid.
    #[error(transparent)]
    Config(#[from] ProcessConfigError),
}

/// Launch layout for one kind of daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonProfile {
    /// Central daemon; ready once every listed port accepts connections.
    Coordinator {
        /// Ports to probe.
        ports: Vec<u16>,
    },
    /// Daemon that joins a coordinator; ready once it is listed as joined.
    Worker {
        /// Peer id announced to the coordinator.
        id: String,
        /// Ports to probe.
        ports: Vec<u16>,
    },
    /// OpenSSH server run in the foreground.
    Sshd {
        /// Listening port.
        port: u16,
    },
}

impl DaemonProfile {
    /// Coordinator probed on `ports`.
    pub fn coordinator(ports: impl IntoIterator<Item = u16>) -> Self {
        Self::Coordinator {
            ports: ports.into_iter().collect(),
        }
    }

    /// Worker named `id` probed on `ports`.
    pub fn worker(id: impl Into<String>, ports: impl IntoIterator<Item = u16>) -> Self {
        Self::Worker {
            id: id.into(),
            ports: ports.into_iter().collect(),
        }
    }

    /// SSH server listening on `port`.
    #[must_use]
    pub const fn sshd(port: u16) -> Self {
        Self::Sshd { port }
    }

    /// Arguments appended after the executable and any `-c` flag.
    #[must_use]
    pub fn args(&self, config_dir: &Utf8Path) -> Vec<String> {
        match self {
            Self::Coordinator { .. } => vec!["-l".to_owned(), "quiet".to_owned()],
            Self::Worker { .. } => vec![
                "--disable-keepalive".to_owned(),
                "-l".to_owned(),
                "quiet".to_owned(),
            ],
            Self::Sshd { .. } => vec![
                "-D".to_owned(),
                "-f".to_owned(),
                config_dir.join("sshd_config").into_string(),
            ],
        }
    }

    /// Readiness checks the daemon declares.
    #[must_use]
    pub fn checks(&self) -> Vec<ReadinessCheck> {
        match self {
            Self::Coordinator { ports } => ports.iter().copied().map(ReadinessCheck::Port).collect(),
            Self::Worker { id, ports } => std::iter::once(ReadinessCheck::peer(id.clone()))
                .chain(ports.iter().copied().map(ReadinessCheck::Port))
                .collect(),
            Self::Sshd { port } => vec![ReadinessCheck::Port(*port)],
        }
    }

    /// Builds the launch configuration for `script`.
    ///
    /// Coordinators and workers run `bin_dir/script` with `-c config_dir`.
    /// The SSH server is looked up on `PATH` and reads its own config file
    /// instead of taking `-c`.
    ///
    /// # Errors
    ///
    /// Returns [`ProfileError::ExecutableNotFound`] when the SSH server is not
    /// installed, or [`ProfileError::Config`] when the result is invalid.
    pub fn to_config(
        &self,
        name: &str,
        bin_dir: &Utf8Path,
        script: &str,
        config_dir: &Utf8Path,
    ) -> Result<ProcessConfig, ProfileError> {
        let executable = match self {
            Self::Sshd { .. } => find_on_path(script)?,
            Self::Coordinator { .. } | Self::Worker { .. } => bin_dir.join(script),
        };
        let mut builder = ProcessConfig::builder(name, executable)
            .config_dir(config_dir)
            .args(self.args(config_dir))
            .checks(self.checks());
        if matches!(self, Self::Sshd { .. }) {
            builder = builder.omit_config_flag();
        }
        Ok(builder.build()?)
    }

    /// Builds a configuration sharing `coordinator`'s binary and config
    /// directories.
    ///
    /// # Errors
    ///
    /// Returns [`ProfileError::MissingLocation`] when the coordinator has no
    /// config directory or its executable has no parent directory, otherwise
    /// as [`DaemonProfile::to_config`].
    pub fn alongside(
        &self,
        coordinator: &ProcessConfig,
        name: &str,
        script: &str,
    ) -> Result<ProcessConfig, ProfileError> {
        let bin_dir = coordinator
            .executable()
            .parent()
            .ok_or_else(|| ProfileError::MissingLocation {
                coordinator: coordinator.name().to_owned(),
                missing: "binary directory",
            })?;
        let config_dir = coordinator
            .config_dir()
            .ok_or_else(|| ProfileError::MissingLocation {
                coordinator: coordinator.name().to_owned(),
                missing: "config directory",
            })?;
        self.to_config(name, bin_dir, script, config_dir)
    }
}

fn find_on_path(program: &str) -> Result<Utf8PathBuf, ProfileError> {
    env::var_os("PATH")
        .and_then(|path| find_in(program, &path))
        .ok_or_else(|| ProfileError::ExecutableNotFound {
            program: program.to_owned(),
        })
}

fn find_in(program: &str, search_path: &OsStr) -> Option<Utf8PathBuf> {
    env::split_paths(search_path)
        .map(|dir| dir.join(program))
        .find(|candidate| {
            candidate
                .metadata()
                .is_ok_and(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        })
        .and_then(|found| Utf8PathBuf::from_path_buf(found).ok())
}

#[cfg(test)]
mod tests {
    use std::ffi::OsString;
    use std::fs;

    use rstest::rstest;
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;

    fn argv(config: &ProcessConfig) -> Vec<String> {
        config
            .command_line()
            .into_iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn coordinator_probes_every_port() {
        let config = DaemonProfile::coordinator([4505, 4506])
            .to_config("coordinator", Utf8Path::new("/opt/bin"), "master", Utf8Path::new("/tmp/c"))
            .expect("config");
        assert_eq!(
            argv(&config),
            ["/opt/bin/master", "-c", "/tmp/c", "-l", "quiet"]
        );
        assert_eq!(
            config.checks(),
            [ReadinessCheck::Port(4505), ReadinessCheck::Port(4506)]
        );
    }

    #[test]
    fn worker_inherits_coordinator_locations() {
        let coordinator = DaemonProfile::coordinator([4506])
            .to_config("coordinator", Utf8Path::new("/opt/bin"), "master", Utf8Path::new("/tmp/c"))
            .expect("coordinator");
        let worker = DaemonProfile::worker("worker-1", [64_100])
            .alongside(&coordinator, "worker-1", "minion")
            .expect("worker");
        assert_eq!(
            argv(&worker),
            [
                "/opt/bin/minion",
                "-c",
                "/tmp/c",
                "--disable-keepalive",
                "-l",
                "quiet"
            ]
        );
        assert!(worker.checks().contains(&ReadinessCheck::peer("worker-1")));
        assert!(worker.checks().contains(&ReadinessCheck::Port(64_100)));
    }

    #[test]
    fn executables_are_found_on_a_search_path() {
        let dir = TempDir::new().expect("temp dir");
        let program = dir.path().join("fake-sshd");
        fs::write(&program, "#!/bin/sh\n").expect("write program");
        fs::set_permissions(&program, fs::Permissions::from_mode(0o755)).expect("chmod");
        let search = OsString::from(format!("/nonexistent:{}", dir.path().display()));

        let found = find_in("fake-sshd", &search).expect("program found");
        assert_eq!(found.as_std_path(), program);
        assert!(find_in("absent-sshd", &search).is_none());
    }

    #[test]
    fn non_executable_files_are_ignored() {
        let dir = TempDir::new().expect("temp dir");
        let program = dir.path().join("plain-file");
        fs::write(&program, "data").expect("write file");
        fs::set_permissions(&program, fs::Permissions::from_mode(0o644)).expect("chmod");
        assert!(find_in("plain-file", dir.path().as_os_str()).is_none());
    }

    #[test]
    fn sshd_reads_its_own_config_file() {
        let profile = DaemonProfile::sshd(2222);
        assert_eq!(
            profile.args(Utf8Path::new("/tmp/ssh")),
            ["-D", "-f", "/tmp/ssh/sshd_config"]
        );
        assert_eq!(profile.checks(), [ReadinessCheck::Port(2222)]);
    }

    #[test]
    fn ssh_profile_targets_localhost() {
        let profile = CommandProfile::ssh("salt-ssh", Utf8Path::new("/tmp/conf"));
        assert!(profile.args().contains(&"--roster-file=/tmp/conf/roster".to_owned()));
        assert_eq!(profile.args().last().map(String::as_str), Some("localhost"));
        assert_eq!(
            profile.decoder(),
            &OutputDecoder::JsonField("localhost".to_owned())
        );
    }

    #[rstest]
    #[case::object(OutputDecoder::Json, r#"{"a": 1}"#, Some(json!({"a": 1})))]
    #[case::blank(OutputDecoder::Json, "  \n", None)]
    #[case::garbage(OutputDecoder::Json, "not json", None)]
    #[case::field(
        OutputDecoder::JsonField("localhost".to_owned()),
        r#"{"localhost": {"ok": true}}"#,
        Some(json!({"ok": true}))
    )]
    #[case::missing_field(OutputDecoder::JsonField("localhost".to_owned()), r#"{"other": 1}"#, None)]
    #[case::raw(OutputDecoder::Raw, r#"{"a": 1}"#, None)]
    fn decoders(#[case] decoder: OutputDecoder, #[case] stdout: &str, #[case] expected: Option<Value>) {
        assert_eq!(decoder.decode("test", stdout), expected);
    }
}
