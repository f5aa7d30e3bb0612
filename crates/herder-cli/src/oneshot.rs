//! `herder run`: execute one command and report its result envelope.

use std::io::{self, Write};
use std::time::Duration;

use camino::Utf8Path;
use thiserror::Error;

use herder::{CommandError, CommandProfile, CommandRunner, EventLoop, ShellResult};
use herder_config::SupervisorSettings;

use crate::cli::RunArgs;

#[derive(Debug, Error)]
pub(crate) enum RunError {
    #[error("failed to create the event loop: {0}")]
    EventLoop(#[source] io::Error),
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("failed to serialise the command result: {0}")]
    Serialise(#[from] serde_json::Error),
    #[error("failed to write the command result: {0}")]
    Write(#[source] io::Error),
}

fn build_runner(args: &RunArgs, settings: &SupervisorSettings) -> (CommandRunner, Vec<String>) {
    let (executable, rest) = args
        .command
        .split_first()
        .map_or(("", &[][..]), |(first, rest)| (first.as_str(), rest));
    let prefix = args.prefix.clone().unwrap_or_else(|| {
        Utf8Path::new(executable)
            .file_name()
            .unwrap_or(executable)
            .to_owned()
    });
    let runner = CommandRunner::from_executable(executable, CommandProfile::plain(prefix.as_str()))
        .with_log_prefix(prefix)
        .with_settings(settings);
    (runner, rest.to_vec())
}

/// Runs the command and writes its result as one JSON line.
pub(crate) fn execute<W: Write>(
    args: &RunArgs,
    settings: &SupervisorSettings,
    stdout: &mut W,
) -> Result<ShellResult, RunError> {
    let (runner, arguments) = build_runner(args, settings);
    let event_loop = EventLoop::new().map_err(RunError::EventLoop)?;
    let timeout = args.timeout.map(Duration::from_secs);
    let result = runner.run_sync(&event_loop, arguments.as_slice(), timeout)?;
    serde_json::to_writer(&mut *stdout, &result)?;
    writeln!(stdout).map_err(RunError::Write)?;
    Ok(result)
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::*;

    fn run_args(prefix: Option<&str>, command: &[&str]) -> RunArgs {
        RunArgs {
            timeout: None,
            prefix: prefix.map(str::to_owned),
            command: command.iter().map(|arg| (*arg).to_owned()).collect(),
        }
    }

    #[test]
    fn prefix_defaults_to_the_executable_name() {
        let (runner, arguments) =
            build_runner(&run_args(None, &["/bin/sh", "-c", "true"]), &SupervisorSettings::default());
        assert_eq!(runner.log_prefix(), "sh");
        assert_eq!(arguments, ["-c", "true"]);
    }

    #[test]
    fn result_is_written_as_json() {
        let mut stdout = Vec::new();
        let result = execute(
            &run_args(Some("probe"), &["/bin/sh", "-c", r#"printf '{"up": true}'; exit 2"#]),
            &SupervisorSettings::default(),
            &mut stdout,
        )
        .expect("run");
        assert_eq!(result.exitcode(), 2);
        let written: Value = serde_json::from_slice(&stdout).expect("json line");
        assert_eq!(written["exitcode"], json!(2));
        assert_eq!(written["json"], json!({"up": true}));
    }
}
