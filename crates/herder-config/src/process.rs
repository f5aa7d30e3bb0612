//! Immutable description of one supervised executable.

use std::collections::BTreeMap;
use std::ffi::OsString;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::readiness::ReadinessCheck;

/// Flag every supervised daemon and command accepts to locate its config.
pub const CONFIG_DIR_FLAG: &str = "-c";

/// Launch description for a supervised process.
///
/// Instances are produced by [`ProcessConfigBuilder::build`] and never change
/// afterwards; every launch attempt reads the same values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessConfig {
    name: String,
    executable: Utf8PathBuf,
    config_dir: Option<Utf8PathBuf>,
    pass_config_dir: bool,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    working_dir: Option<Utf8PathBuf>,
    checks: Vec<ReadinessCheck>,
}

impl ProcessConfig {
    /// Starts building a configuration for `executable` under a display name.
    #[must_use]
    pub fn builder(
        name: impl Into<String>,
        executable: impl Into<Utf8PathBuf>,
    ) -> ProcessConfigBuilder {
        ProcessConfigBuilder {
            name: name.into(),
            executable: executable.into(),
            config_dir: None,
            pass_config_dir: true,
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
            checks: Vec::new(),
        }
    }

    /// Display name, also used as the default log prefix.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path to the executable.
    #[must_use]
    pub fn executable(&self) -> &Utf8Path {
        &self.executable
    }

    /// Directory holding the daemon's configuration, if any.
    #[must_use]
    pub fn config_dir(&self) -> Option<&Utf8Path> {
        self.config_dir.as_deref()
    }

    /// Extra arguments appended after the base arguments.
    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Environment overrides applied on top of the inherited environment.
    #[must_use]
    pub const fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// Working directory for the process, if it differs from ours.
    #[must_use]
    pub fn working_dir(&self) -> Option<&Utf8Path> {
        self.working_dir.as_deref()
    }

    /// Declared readiness checks.
    #[must_use]
    pub fn checks(&self) -> &[ReadinessCheck] {
        &self.checks
    }

    /// Full argument vector, executable first.
    ///
    /// The config directory is passed as `-c <dir>` ahead of the remaining
    /// arguments unless the builder opted out with
    /// [`ProcessConfigBuilder::omit_config_flag`].
    #[must_use]
    pub fn command_line(&self) -> Vec<OsString> {
        let mut argv = vec![OsString::from(self.executable.as_str())];
        if self.pass_config_dir
            && let Some(dir) = &self.config_dir
        {
            argv.push(OsString::from(CONFIG_DIR_FLAG));
            argv.push(OsString::from(dir.as_str()));
        }
        argv.extend(self.args.iter().map(OsString::from));
        argv
    }
}

/// Builder for [`ProcessConfig`].
#[derive(Debug, Clone)]
pub struct ProcessConfigBuilder {
    name: String,
    executable: Utf8PathBuf,
    config_dir: Option<Utf8PathBuf>,
    pass_config_dir: bool,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    working_dir: Option<Utf8PathBuf>,
    checks: Vec<ReadinessCheck>,
}

impl ProcessConfigBuilder {
    /// Sets the configuration directory passed with `-c`.
    #[must_use]
    pub fn config_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.config_dir = Some(dir.into());
        self
    }

    /// Keeps the config directory on record without passing `-c` to the process.
    #[must_use]
    pub fn omit_config_flag(mut self) -> Self {
        self.pass_config_dir = false;
        self
    }

    /// Appends one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several arguments in order.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Adds an environment override.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Sets the working directory.
    #[must_use]
    pub fn working_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Declares one readiness check. Duplicates are ignored.
    #[must_use]
    pub fn check(mut self, check: ReadinessCheck) -> Self {
        if !self.checks.contains(&check) {
            self.checks.push(check);
        }
        self
    }

    /// Declares several readiness checks.
    #[must_use]
    pub fn checks<I>(self, checks: I) -> Self
    where
        I: IntoIterator<Item = ReadinessCheck>,
    {
        checks.into_iter().fold(self, Self::check)
    }

    /// Validates and freezes the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessConfigError`] when the name or executable is empty, or
    /// when a port check names port zero.
    pub fn build(self) -> Result<ProcessConfig, ProcessConfigError> {
        if self.name.trim().is_empty() {
            return Err(ProcessConfigError::EmptyName);
        }
        if self.executable.as_str().is_empty() {
            return Err(ProcessConfigError::EmptyExecutable { name: self.name });
        }
        if self.checks.contains(&ReadinessCheck::Port(0)) {
            return Err(ProcessConfigError::InvalidPort { name: self.name });
        }
        Ok(ProcessConfig {
            name: self.name,
            executable: self.executable,
            config_dir: self.config_dir,
            pass_config_dir: self.pass_config_dir,
            args: self.args,
            env: self.env,
            working_dir: self.working_dir,
            checks: self.checks,
        })
    }
}

/// Validation failures raised by [`ProcessConfigBuilder::build`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcessConfigError {
    /// The display name was blank.
    #[error("process name must not be empty")]
    EmptyName,
    /// No executable was given.
    #[error("process '{name}' has no executable")]
    EmptyExecutable {
        /// Display name of the offending process.
        name: String,
    },
    /// Port zero cannot be probed.
    #[error("process '{name}' declares a readiness check on port 0")]
    InvalidPort {
        /// Display name of the offending process.
        name: String,
    },
}
