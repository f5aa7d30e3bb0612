//! Settings bootstrap for the CLI.
//!
//! Settings flags must precede the subcommand. They are peeled off the
//! argument list and handed to `ortho-config`; the rest goes to `clap`.

use std::ffi::{OsStr, OsString};
use std::sync::Arc;

use herder_config::SupervisorSettings;
use ortho_config::OrthoConfig;

/// Flags owned by [`SupervisorSettings`]. Keep in step with its fields.
const SETTINGS_FLAGS: &[&str] = &[
    "--max-attempts",
    "--readiness-timeout-ms",
    "--readiness-retry-timeout-ms",
    "--alive-grace-ms",
    "--poll-interval-ms",
    "--command-timeout-secs",
    "--log-filter",
    "--log-format",
];

pub(crate) trait SettingsLoader {
    fn load(&self, args: &[OsString]) -> Result<SupervisorSettings, Arc<ortho_config::OrthoError>>;
}

pub(crate) struct OrthoSettingsLoader;

impl SettingsLoader for OrthoSettingsLoader {
    fn load(&self, args: &[OsString]) -> Result<SupervisorSettings, Arc<ortho_config::OrthoError>> {
        SupervisorSettings::load_from_iter(args.iter().cloned())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlagAction {
    Include { needs_value: bool },
    Stop,
}

fn classify(argument: &OsStr) -> FlagAction {
    let text = argument.to_string_lossy();
    let (flag, inline_value) = match text.split_once('=') {
        Some((flag, _)) => (flag, true),
        None => (text.as_ref(), false),
    };
    if SETTINGS_FLAGS.contains(&flag) {
        FlagAction::Include {
            needs_value: !inline_value,
        }
    } else {
        FlagAction::Stop
    }
}

/// Arguments split between the settings loader and the command parser.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct ArgumentSplit {
    /// Program name followed by the leading settings flags.
    pub(crate) settings: Vec<OsString>,
    /// Program name followed by everything after the settings flags.
    pub(crate) command: Vec<OsString>,
}

pub(crate) fn split_arguments(args: &[OsString]) -> ArgumentSplit {
    let Some((program, rest)) = args.split_first() else {
        return ArgumentSplit::default();
    };
    let mut settings = vec![program.clone()];
    let mut remaining = rest.iter();
    let mut command = vec![program.clone()];
    while let Some(argument) = remaining.next() {
        match classify(argument) {
            FlagAction::Include { needs_value } => {
                settings.push(argument.clone());
                if needs_value && let Some(value) = remaining.next() {
                    settings.push(value.clone());
                }
            }
            FlagAction::Stop => {
                command.push(argument.clone());
                break;
            }
        }
    }
    command.extend(remaining.cloned());
    ArgumentSplit { settings, command }
}
