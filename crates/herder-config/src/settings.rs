//! Layered supervisor settings.

use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::{Deserialize, Serialize};

use crate::defaults::{
    DEFAULT_ALIVE_GRACE_MS, DEFAULT_COMMAND_TIMEOUT_SECS, DEFAULT_MAX_ATTEMPTS,
    DEFAULT_POLL_INTERVAL_MS, DEFAULT_READINESS_RETRY_TIMEOUT_MS, DEFAULT_READINESS_TIMEOUT_MS,
    default_log_filter_string, default_log_format,
};
use crate::logging::LogFormat;

/// Tunables shared by the daemon supervisor and the one-shot command runner.
///
/// Values are merged from defaults, an optional configuration file,
/// `HERDER_*` environment variables, and command-line flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, OrthoConfig)]
#[ortho_config(prefix = "HERDER")]
pub struct SupervisorSettings {
    /// Launch attempts before a daemon start is reported unrecoverable.
    #[ortho_config(default = DEFAULT_MAX_ATTEMPTS)]
    pub max_attempts: u32,
    /// First readiness budget, in milliseconds.
    #[ortho_config(default = DEFAULT_READINESS_TIMEOUT_MS)]
    pub readiness_timeout_ms: u64,
    /// Second readiness budget applied once the first lapses, in milliseconds.
    #[ortho_config(default = DEFAULT_READINESS_RETRY_TIMEOUT_MS)]
    pub readiness_retry_timeout_ms: u64,
    /// Window a fresh process must survive to count as alive, in milliseconds.
    #[ortho_config(default = DEFAULT_ALIVE_GRACE_MS)]
    pub alive_grace_ms: u64,
    /// Pause between passes over pending readiness checks, in milliseconds.
    #[ortho_config(default = DEFAULT_POLL_INTERVAL_MS)]
    pub poll_interval_ms: u64,
    /// Budget for one-shot commands, in seconds.
    #[ortho_config(default = DEFAULT_COMMAND_TIMEOUT_SECS)]
    pub command_timeout_secs: u64,
    /// `tracing` filter expression.
    #[ortho_config(default = default_log_filter_string())]
    pub log_filter: String,
    /// Log output format.
    #[ortho_config(default = default_log_format())]
    pub log_format: LogFormat,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            readiness_timeout_ms: DEFAULT_READINESS_TIMEOUT_MS,
            readiness_retry_timeout_ms: DEFAULT_READINESS_RETRY_TIMEOUT_MS,
            alive_grace_ms: DEFAULT_ALIVE_GRACE_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            command_timeout_secs: DEFAULT_COMMAND_TIMEOUT_SECS,
            log_filter: default_log_filter_string(),
            log_format: default_log_format(),
        }
    }
}

impl SupervisorSettings {
    /// Attempts allowed per daemon start; never less than one.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// First readiness budget.
    #[must_use]
    pub const fn readiness_timeout(&self) -> Duration {
        Duration::from_millis(self.readiness_timeout_ms)
    }

    /// Second readiness budget.
    #[must_use]
    pub const fn readiness_retry_timeout(&self) -> Duration {
        Duration::from_millis(self.readiness_retry_timeout_ms)
    }

    /// Liveness confirmation window.
    #[must_use]
    pub const fn alive_grace(&self) -> Duration {
        Duration::from_millis(self.alive_grace_ms)
    }

    /// Pause between readiness passes.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// One-shot command budget.
    #[must_use]
    pub const fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// Configured log filter.
    #[must_use]
    pub fn log_filter(&self) -> &str {
        &self.log_filter
    }

    /// Configured log format.
    #[must_use]
    pub const fn log_format(&self) -> LogFormat {
        self.log_format
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_budgets() {
        let settings = SupervisorSettings::default();
        assert_eq!(settings.attempts(), 3);
        assert_eq!(settings.readiness_timeout(), Duration::from_secs(10));
        assert_eq!(settings.readiness_retry_timeout(), Duration::from_secs(5));
        assert_eq!(settings.poll_interval(), Duration::from_millis(500));
        assert_eq!(settings.command_timeout(), Duration::from_secs(25));
        assert_eq!(settings.log_filter(), "info");
        assert_eq!(settings.log_format(), LogFormat::Json);
    }

    #[test]
    fn zero_attempts_still_tries_once() {
        let settings = SupervisorSettings {
            max_attempts: 0,
            ..SupervisorSettings::default()
        };
        assert_eq!(settings.attempts(), 1);
    }
}
