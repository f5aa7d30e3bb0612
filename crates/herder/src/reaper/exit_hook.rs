//! Process-exit safety net for supervised daemons.
//!
//! Every spawned daemon pid is registered here. A single `atexit` handler,
//! installed on first registration, reaps the descendants of each pid still
//! registered and then kills the pid itself. Clean teardown unregisters the
//! pid so the handler never touches it.

use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard, Once, PoisonError};

use nix::sys::signal::{Signal, kill};
use once_cell::sync::Lazy;
use tracing::{debug, warn};

use super::{REAPER_TARGET, reap_descendants};
use crate::terminal::nix_pid;

static REGISTRY: Lazy<Mutex<BTreeSet<u32>>> = Lazy::new(|| Mutex::new(BTreeSet::new()));
static INSTALL: Once = Once::new();

/// Adds `pid` to the exit-time kill list.
///
/// Returns `false` when the pid was already registered; registering twice
/// never kills twice.
pub fn register(pid: u32) -> bool {
    INSTALL.call_once(install_handler);
    registry().insert(pid)
}

/// Removes `pid` from the exit-time kill list.
///
/// Returns `false` when the pid was not registered.
pub fn unregister(pid: u32) -> bool {
    registry().remove(&pid)
}

/// Whether `pid` is currently registered.
#[must_use]
pub fn is_registered(pid: u32) -> bool {
    registry().contains(&pid)
}

fn registry() -> MutexGuard<'static, BTreeSet<u32>> {
    REGISTRY.lock().unwrap_or_else(PoisonError::into_inner)
}

fn install_handler() {
    // SAFETY: `reap_registered` is a plain `extern "C"` function with no
    // arguments, as `atexit` requires.
    let status = unsafe { libc::atexit(reap_registered) };
    if status != 0 {
        warn!(
            target: REAPER_TARGET,
            status,
            "failed to install the exit-time reaper"
        );
    }
}

extern "C" fn reap_registered() {
    let pids = std::mem::take(&mut *registry());
    for pid in pids {
        match reap_descendants(pid) {
            Ok(report) => debug!(
                target: REAPER_TARGET,
                pid,
                reaped = report.reaped().len(),
                "exit-time reaping finished"
            ),
            Err(error) => warn!(target: REAPER_TARGET, pid, %error, "exit-time reaping failed"),
        }
        if let Some(target) = nix_pid(pid)
            && let Err(errno) = kill(target, Signal::SIGKILL)
        {
            debug!(target: REAPER_TARGET, pid, %errno, "exit-time kill not delivered");
        }
    }
}
