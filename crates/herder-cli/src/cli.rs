//! Command-line argument definitions for `herder`.

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};

/// Supervises daemons and runs one-shot commands.
#[derive(Parser, Debug)]
#[command(name = "herder", version, disable_help_subcommand = true)]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub(crate) command: CliCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum CliCommand {
    /// Starts a daemon, waits for it to become ready, and keeps it running
    /// until a termination signal arrives.
    Daemon(DaemonArgs),
    /// Runs a command to completion and prints its result as JSON.
    Run(RunArgs),
}

#[derive(Args, Debug)]
pub(crate) struct DaemonArgs {
    /// Display name used in logs.
    #[arg(long)]
    pub(crate) name: String,
    /// TCP port that must accept connections before the daemon counts as
    /// ready. May be repeated.
    #[arg(long = "port", value_name = "PORT")]
    pub(crate) ports: Vec<u16>,
    /// Configuration directory passed to the daemon as `-c <DIR>`.
    #[arg(long, value_name = "DIR")]
    pub(crate) config_dir: Option<Utf8PathBuf>,
    /// Executable followed by its arguments.
    #[arg(required = true, last = true, value_name = "COMMAND")]
    pub(crate) command: Vec<String>,
}

#[derive(Args, Debug)]
pub(crate) struct RunArgs {
    /// Seconds before the command is killed; defaults to the configured
    /// command timeout.
    #[arg(long, value_name = "SECONDS")]
    pub(crate) timeout: Option<u64>,
    /// Prefix used in logs and exported to the command.
    #[arg(long)]
    pub(crate) prefix: Option<String>,
    /// Executable followed by its arguments.
    #[arg(required = true, last = true, value_name = "COMMAND")]
    pub(crate) command: Vec<String>,
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::{Cli, CliCommand};

    #[test]
    fn daemon_collects_repeated_ports() {
        let cli = Cli::try_parse_from([
            "herder", "daemon", "--name", "master", "--port", "4505", "--port", "4506", "--",
            "salt-master", "-l", "quiet",
        ])
        .expect("parse");
        let CliCommand::Daemon(args) = cli.command else {
            panic!("expected daemon subcommand");
        };
        assert_eq!(args.ports, [4505, 4506]);
        assert_eq!(args.command, ["salt-master", "-l", "quiet"]);
        assert!(args.config_dir.is_none());
    }

    #[test]
    fn run_requires_a_command() {
        let error = Cli::try_parse_from(["herder", "run", "--timeout", "5"])
            .expect_err("command is required");
        assert_eq!(error.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }
}
