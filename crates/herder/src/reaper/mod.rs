//! Kills the processes a supervised daemon leaves behind.
//!
//! Daemons commonly fork workers that outlive them. Before a daemon's own
//! process is shut down its descendant tree is captured with
//! [`snapshot_descendants`]; once the parent is gone [`reap`] kills whatever is
//! still running. [`exit_hook`] repeats the same work from an `atexit` handler
//! should the supervising process end without tearing its daemons down.

pub mod exit_hook;

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System, UpdateKind};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::terminal::nix_pid;

pub(crate) const REAPER_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::reaper");

const KILL_BUDGET: Duration = Duration::from_secs(5);
const LIVENESS_POLL: Duration = Duration::from_millis(50);

/// A process found below a supervised daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descendant {
    pid: u32,
    command_line: String,
}

impl Descendant {
    /// OS process id.
    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    /// Space-joined command line as seen in the process table.
    #[must_use]
    pub fn command_line(&self) -> &str {
        &self.command_line
    }
}

/// Outcome of one reaping pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReapReport {
    reaped: Vec<u32>,
    vanished: Vec<u32>,
    survivors: Vec<u32>,
}

impl ReapReport {
    /// Processes that were signalled and are gone.
    #[must_use]
    pub fn reaped(&self) -> &[u32] {
        &self.reaped
    }

    /// Processes that had already exited before they could be signalled.
    #[must_use]
    pub fn vanished(&self) -> &[u32] {
        &self.vanished
    }

    /// Processes still running after every wait lapsed.
    #[must_use]
    pub fn survivors(&self) -> &[u32] {
        &self.survivors
    }

    /// Whether nothing was left running.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.survivors.is_empty()
    }
}

/// Errors raised while reaping.
#[derive(Debug, Error)]
pub enum ReapError {
    /// A descendant could not be signalled, typically for lack of permission.
    #[error("failed to send {signal} to descendant pid {pid}: {source}")]
    Signal {
        /// Target process id.
        pid: u32,
        /// Signal that was sent.
        signal: Signal,
        /// Underlying errno.
        #[source]
        source: Errno,
    },
}

/// Captures every live descendant of `pid`, parents before children.
///
/// The root itself is not included. Zombies and threads are skipped.
#[must_use]
pub fn snapshot_descendants(pid: u32) -> Vec<Descendant> {
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::All,
        true,
        ProcessRefreshKind::nothing().with_cmd(UpdateKind::Always),
    );

    let mut children: BTreeMap<Pid, Vec<Pid>> = BTreeMap::new();
    for (child, process) in system.processes() {
        if process.status() == ProcessStatus::Zombie || process.thread_kind().is_some() {
            continue;
        }
        if let Some(parent) = process.parent() {
            children.entry(parent).or_default().push(*child);
        }
    }

    let root = Pid::from_u32(pid);
    let mut seen = BTreeSet::from([root]);
    let mut queue = VecDeque::from([root]);
    let mut found = Vec::new();
    while let Some(parent) = queue.pop_front() {
        let Some(direct) = children.get(&parent) else {
            continue;
        };
        let mut ordered = direct.clone();
        ordered.sort_unstable();
        for child in ordered {
            if !seen.insert(child) {
                continue;
            }
            let command_line = system.process(child).map_or_else(String::new, |process| {
                process
                    .cmd()
                    .iter()
                    .map(|arg| arg.to_string_lossy())
                    .collect::<Vec<_>>()
                    .join(" ")
            });
            found.push(Descendant {
                pid: child.as_u32(),
                command_line,
            });
            queue.push_back(child);
        }
    }
    found
}

/// Kills each of `descendants` and waits for it to disappear.
///
/// Each process gets SIGKILL and up to five seconds to go away, then a
/// second SIGKILL. Anything still running afterwards shares one final
/// five-second wait and is reported in [`ReapReport::survivors`]. Processes
/// that exited between the snapshot and the signal are recorded as vanished.
///
/// # Errors
///
/// Returns [`ReapError::Signal`] when a signal is refused for a reason other
/// than the process having vanished.
pub fn reap(descendants: &[Descendant]) -> Result<ReapReport, ReapError> {
    let mut report = ReapReport::default();
    let mut lingering = Vec::new();
    for descendant in descendants {
        info!(
            target: REAPER_TARGET,
            pid = descendant.pid,
            command_line = %descendant.command_line,
            "killing a process left behind by a supervised daemon"
        );
        if !send_kill(descendant.pid)? {
            report.vanished.push(descendant.pid);
            continue;
        }
        if wait_until_gone(&[descendant.pid], KILL_BUDGET).is_empty() {
            report.reaped.push(descendant.pid);
            continue;
        }
        warn!(
            target: REAPER_TARGET,
            pid = descendant.pid,
            "descendant outlived the kill budget; forcing"
        );
        if send_kill(descendant.pid)? {
            lingering.push(descendant.pid);
        } else {
            report.reaped.push(descendant.pid);
        }
    }

    if !lingering.is_empty() {
        let survivors = wait_until_gone(&lingering, KILL_BUDGET);
        for pid in lingering {
            if survivors.contains(&pid) {
                warn!(target: REAPER_TARGET, pid, "descendant survived reaping");
            } else {
                report.reaped.push(pid);
            }
        }
        report.survivors = survivors;
    }
    Ok(report)
}

/// Snapshots and reaps every descendant of `pid`.
///
/// # Errors
///
/// See [`reap`].
pub fn reap_descendants(pid: u32) -> Result<ReapReport, ReapError> {
    reap(&snapshot_descendants(pid))
}

/// Whether `pid` names a running, non-zombie process.
#[must_use]
pub fn is_alive(pid: u32) -> bool {
    let target = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[target]),
        true,
        ProcessRefreshKind::nothing(),
    );
    system
        .process(target)
        .is_some_and(|process| process.status() != ProcessStatus::Zombie)
}

/// Sends SIGKILL; `Ok(false)` means the process was already gone.
fn send_kill(pid: u32) -> Result<bool, ReapError> {
    let Some(target) = nix_pid(pid) else {
        return Ok(false);
    };
    match kill(target, Signal::SIGKILL) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => {
            debug!(target: REAPER_TARGET, pid, "descendant already exited");
            Ok(false)
        }
        Err(source) => Err(ReapError::Signal {
            pid,
            signal: Signal::SIGKILL,
            source,
        }),
    }
}

/// Polls until every pid is gone or `budget` lapses; returns the survivors.
fn wait_until_gone(pids: &[u32], budget: Duration) -> Vec<u32> {
    let deadline = Instant::now() + budget;
    loop {
        let alive: Vec<u32> = pids.iter().copied().filter(|pid| is_alive(*pid)).collect();
        if alive.is_empty() || Instant::now() >= deadline {
            return alive;
        }
        thread::sleep(LIVENESS_POLL);
    }
}

#[cfg(test)]
mod tests {
    use crate::terminal::{OutputMode, Terminal, TerminalSpec};

    use super::*;

    fn wait_for_descendants(pid: u32, count: usize) -> Vec<Descendant> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let found = snapshot_descendants(pid);
            if found.len() >= count || Instant::now() >= deadline {
                return found;
            }
            thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn reaps_both_children_of_a_forking_parent() {
        let spec = TerminalSpec::new(
            ["/bin/sh", "-c", "sleep 60 & sleep 60 & wait"],
            OutputMode::Inherit,
        );
        let mut parent = Terminal::start(&spec).expect("start parent");
        let children = wait_for_descendants(parent.pid(), 2);
        assert_eq!(children.len(), 2, "expected two sleeping children");
        assert!(
            children
                .iter()
                .all(|child| child.command_line().contains("sleep"))
        );

        let report = reap(&children).expect("reap children");
        assert!(report.is_clean());
        for child in &children {
            assert!(!is_alive(child.pid()), "pid {} still alive", child.pid());
        }
        parent.shutdown().expect("shutdown parent");
    }

    #[test]
    fn vanished_descendants_are_skipped() {
        let mut short = Terminal::start(&TerminalSpec::new(["/bin/true"], OutputMode::Inherit))
            .expect("start true");
        let pid = short.pid();
        short.shutdown().expect("shutdown");
        let report = reap(&[Descendant {
            pid,
            command_line: "/bin/true".to_owned(),
        }])
        .expect("vanished process is not an error");
        assert_eq!(report.vanished(), [pid]);
        assert!(report.reaped().is_empty());
    }

    #[test]
    fn process_without_children_has_empty_snapshot() {
        let mut lone = Terminal::start(&TerminalSpec::new(
            ["/bin/sh", "-c", "exec sleep 30"],
            OutputMode::Inherit,
        ))
        .expect("start sleeper");
        assert!(snapshot_descendants(lone.pid()).is_empty());
        let report = reap_descendants(lone.pid()).expect("reap");
        assert_eq!(report, ReapReport::default());
        lone.shutdown().expect("shutdown");
    }
}
