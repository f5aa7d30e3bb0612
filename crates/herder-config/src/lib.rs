//! Shared configuration types for the herder supervisor.
//!
//! This crate holds the immutable descriptions handed to the supervisor: the
//! [`ProcessConfig`] describing one supervised executable, the
//! [`ReadinessCheck`] variants a daemon declares, and the layered
//! [`SupervisorSettings`] that tune retry budgets, timeouts, and logging.
//!
//! Settings are resolved through `ortho_config`, so values may come from
//! defaults, a configuration file, `HERDER_*` environment variables, or
//! command-line flags, in increasing order of precedence.

mod defaults;
mod logging;
mod process;
mod readiness;
mod settings;

pub use defaults::{
    DEFAULT_ALIVE_GRACE_MS, DEFAULT_COMMAND_TIMEOUT_SECS, DEFAULT_LOG_FILTER,
    DEFAULT_MAX_ATTEMPTS, DEFAULT_POLL_INTERVAL_MS, DEFAULT_READINESS_RETRY_TIMEOUT_MS,
    DEFAULT_READINESS_TIMEOUT_MS, default_log_filter_string,
    default_log_format,
};
pub use logging::{LogFormat, LogFormatParseError};
pub use process::{CONFIG_DIR_FLAG, ProcessConfig, ProcessConfigBuilder, ProcessConfigError};
pub use readiness::ReadinessCheck;
pub use settings::SupervisorSettings;
