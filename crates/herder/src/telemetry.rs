//! Structured telemetry initialisation for supervisor hosts.
//!
//! The subscriber is installed once per process. Its first record states the
//! supervision settings in effect so a log stream can be read without the
//! configuration that produced it.

use std::io::{self, IsTerminal};

use once_cell::sync::OnceCell;
use tracing::{Subscriber, info, subscriber::SetGlobalDefaultError};
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::{EnvFilter, fmt};

use herder_config::{LogFormat, SupervisorSettings};

const TELEMETRY_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::telemetry");

static TELEMETRY_GUARD: OnceCell<LogFormat> = OnceCell::new();

/// Handle returned when telemetry has been initialised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelemetryHandle {
    format: LogFormat,
}

impl TelemetryHandle {
    /// Output format of the installed subscriber.
    ///
    /// After the first call this reflects the first caller's settings.
    #[must_use]
    pub const fn format(&self) -> LogFormat {
        self.format
    }
}

/// Errors encountered while configuring telemetry.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// The configured log filter expression does not parse.
    #[error("invalid log filter '{filter}': {source}")]
    Filter {
        /// Expression as configured.
        filter: String,
        /// Parser diagnostic.
        #[source]
        source: ParseError,
    },
    /// Failed to install the tracing subscriber.
    #[error("failed to install telemetry subscriber: {0}")]
    Subscriber(SetGlobalDefaultError),
}

/// Installs the global tracing subscriber on first use.
///
/// Later calls return a handle for the subscriber already installed without
/// touching global state, so test binaries may call this from every test.
///
/// # Errors
///
/// Returns [`TelemetryError`] when the filter does not parse or another
/// subscriber was already installed by someone else.
pub fn initialise(settings: &SupervisorSettings) -> Result<TelemetryHandle, TelemetryError> {
    let format = TELEMETRY_GUARD.get_or_try_init(|| {
        install_subscriber(settings)?;
        record_settings(settings);
        Ok::<_, TelemetryError>(settings.log_format())
    })?;
    Ok(TelemetryHandle { format: *format })
}

fn parse_filter(settings: &SupervisorSettings) -> Result<EnvFilter, TelemetryError> {
    EnvFilter::try_new(settings.log_filter()).map_err(|source| TelemetryError::Filter {
        filter: settings.log_filter().to_owned(),
        source,
    })
}

fn install_subscriber(settings: &SupervisorSettings) -> Result<(), TelemetryError> {
    let filter = parse_filter(settings)?;

    let builder = |env_filter: EnvFilter| {
        fmt::Subscriber::builder()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_level(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_writer(io::stderr)
            .with_ansi(io::stderr().is_terminal())
            .with_timer(fmt::time::UtcTime::rfc_3339())
    };

    let subscriber: Box<dyn Subscriber + Send + Sync> = match settings.log_format() {
        LogFormat::Json => Box::new(builder(filter).json().flatten_event(true).finish()),
        LogFormat::Compact => Box::new(builder(filter).compact().finish()),
    };

    tracing::subscriber::set_global_default(subscriber).map_err(TelemetryError::Subscriber)
}

fn record_settings(settings: &SupervisorSettings) {
    info!(
        target: TELEMETRY_TARGET,
        attempts = settings.attempts(),
        readiness_timeout = ?settings.readiness_timeout(),
        readiness_retry_timeout = ?settings.readiness_retry_timeout(),
        alive_grace = ?settings.alive_grace(),
        poll_interval = ?settings.poll_interval(),
        command_timeout = ?settings.command_timeout(),
        log_filter = settings.log_filter(),
        log_format = %settings.log_format(),
        "supervision settings in effect"
    );
}
