//! Command-line front end for the `herder` supervisor.
//!
//! [`run`] loads layered settings, initialises telemetry, parses the
//! subcommand, and dispatches to daemon supervision or one-shot execution.
//! IO streams are injected so tests can capture output.

use std::ffi::OsString;
use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use clap::error::ErrorKind;
use thiserror::Error;

use herder::telemetry::{self, TelemetryError};

mod cli;
mod config;
mod daemon;
mod oneshot;

use cli::{Cli, CliCommand};
use config::{OrthoSettingsLoader, SettingsLoader, split_arguments};
use daemon::DaemonError;
use oneshot::RunError;

const CLI_TARGET: &str = env!("CARGO_PKG_NAME");

#[derive(Debug, Error)]
enum AppError {
    #[error("{0}")]
    CliUsage(clap::Error),
    #[error("failed to load configuration: {0}")]
    LoadConfiguration(Arc<ortho_config::OrthoError>),
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),
    #[error(transparent)]
    Daemon(#[from] DaemonError),
    #[error(transparent)]
    Run(#[from] RunError),
}

/// Runs the CLI with the given arguments and IO handles.
#[must_use]
pub fn run<I, W, E>(args: I, stdout: &mut W, stderr: &mut E) -> ExitCode
where
    I: IntoIterator<Item = OsString>,
    W: Write,
    E: Write,
{
    run_with_loader(args, stdout, stderr, &OrthoSettingsLoader)
}

fn run_with_loader<I, W, E, L>(args: I, stdout: &mut W, stderr: &mut E, loader: &L) -> ExitCode
where
    I: IntoIterator<Item = OsString>,
    W: Write,
    E: Write,
    L: SettingsLoader,
{
    let arguments: Vec<OsString> = args.into_iter().collect();
    let split = split_arguments(&arguments);

    let parsed = match Cli::try_parse_from(&split.command) {
        Ok(cli) => cli,
        Err(error) if matches!(error.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            return match write!(stdout, "{error}") {
                Ok(()) => ExitCode::SUCCESS,
                Err(_) => ExitCode::FAILURE,
            };
        }
        Err(error) => return report(stderr, &AppError::CliUsage(error)),
    };

    match dispatch(parsed, &split.settings, stdout, loader) {
        Ok(code) => code,
        Err(error) => report(stderr, &error),
    }
}

fn dispatch<W, L>(
    cli: Cli,
    settings_args: &[OsString],
    stdout: &mut W,
    loader: &L,
) -> Result<ExitCode, AppError>
where
    W: Write,
    L: SettingsLoader,
{
    let settings = loader
        .load(settings_args)
        .map_err(AppError::LoadConfiguration)?;
    telemetry::initialise(&settings)?;
    match cli.command {
        CliCommand::Daemon(args) => {
            daemon::supervise(&args, &settings)?;
            Ok(ExitCode::SUCCESS)
        }
        CliCommand::Run(args) => {
            let result = oneshot::execute(&args, &settings, stdout)?;
            Ok(exit_code_for(result.exitcode()))
        }
    }
}

fn exit_code_for(code: i32) -> ExitCode {
    u8::try_from(code).map_or(ExitCode::FAILURE, ExitCode::from)
}

fn report<E: Write>(stderr: &mut E, error: &AppError) -> ExitCode {
    if let Err(write_error) = writeln!(stderr, "{error}") {
        tracing::debug!(target: CLI_TARGET, %write_error, "failed to report error on stderr");
    }
    ExitCode::FAILURE
}
