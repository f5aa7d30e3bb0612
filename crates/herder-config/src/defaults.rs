/// Number of launch attempts before a daemon start is declared unrecoverable.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Primary readiness budget for a freshly spawned daemon, in milliseconds.
pub const DEFAULT_READINESS_TIMEOUT_MS: u64 = 10_000;

/// Second, shorter readiness budget applied after the first one lapses.
pub const DEFAULT_READINESS_RETRY_TIMEOUT_MS: u64 = 5_000;

/// Window during which a new process must stay up to count as alive.
pub const DEFAULT_ALIVE_GRACE_MS: u64 = 250;

/// Pause between full passes over the pending readiness checks.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;

/// Budget for one-shot command invocations, in seconds.
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 25;

/// Default log filter expression used by the binaries.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Owned log filter value used where allocation is required (e.g. serde).
pub fn default_log_filter_string() -> String {
    DEFAULT_LOG_FILTER.to_owned()
}

/// Default logging format for the binaries.
pub fn default_log_format() -> crate::logging::LogFormat {
    crate::logging::LogFormat::Json
}
