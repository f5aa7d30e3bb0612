//! Single-threaded cooperative scheduler shared by one test scope.
//!
//! An [`EventLoop`] wraps a tokio current-thread runtime. Blocking entry points
//! such as [`crate::DaemonSupervisor::start`] take one explicitly. Callers that
//! prefer ambient access install a loop as the thread's current one with
//! [`EventLoop::install`]; the returned guard restores whatever was current
//! before, so a per-test loop may nest inside a per-run loop.

use std::cell::RefCell;
use std::future::Future;
use std::io;
use std::rc::Rc;
use std::time::Duration;

use tokio::runtime::{Builder, Runtime};
use tokio::time::error::Elapsed;

thread_local! {
    static CURRENT: RefCell<Option<Rc<EventLoop>>> = const { RefCell::new(None) };
}

/// Cooperative scheduler driving every wait in this crate.
#[derive(Debug)]
pub struct EventLoop {
    runtime: Runtime,
}

impl EventLoop {
    /// Builds a fresh current-thread scheduler with timers and sockets enabled.
    ///
    /// # Errors
    ///
    /// Returns the IO error raised while creating the runtime.
    pub fn new() -> io::Result<Self> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        Ok(Self { runtime })
    }

    /// Drives `future` to completion on this thread.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    /// Drives `future` for at most `timeout`.
    ///
    /// The future is dropped when the timeout lapses, which kills any process
    /// it still owns.
    ///
    /// # Errors
    ///
    /// Returns [`Elapsed`] when the timeout lapses first.
    pub fn run_sync<F: Future>(&self, future: F, timeout: Duration) -> Result<F::Output, Elapsed> {
        self.runtime
            .block_on(async { tokio::time::timeout(timeout, future).await })
    }

    /// Makes this loop the thread's current one until the guard drops.
    #[must_use = "the loop stops being current when the guard drops"]
    pub fn install(self: &Rc<Self>) -> CurrentLoopGuard {
        let previous = CURRENT.with(|slot| slot.replace(Some(Rc::clone(self))));
        CurrentLoopGuard { previous }
    }

    /// The loop most recently installed on this thread, if any.
    #[must_use]
    pub fn current() -> Option<Rc<Self>> {
        CURRENT.with(|slot| slot.borrow().clone())
    }
}

/// Restores the previously current loop when dropped.
#[derive(Debug)]
pub struct CurrentLoopGuard {
    previous: Option<Rc<EventLoop>>,
}

impl Drop for CurrentLoopGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|slot| {
            slot.replace(previous);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_installs_restore_in_stack_order() {
        let outer = Rc::new(EventLoop::new().expect("outer loop"));
        let inner = Rc::new(EventLoop::new().expect("inner loop"));
        assert!(EventLoop::current().is_none());

        let outer_guard = outer.install();
        let current = EventLoop::current().expect("outer installed");
        assert!(Rc::ptr_eq(&current, &outer));
        {
            let _inner_guard = inner.install();
            let nested = EventLoop::current().expect("inner installed");
            assert!(Rc::ptr_eq(&nested, &inner));
        }
        let restored = EventLoop::current().expect("outer restored");
        assert!(Rc::ptr_eq(&restored, &outer));
        drop(outer_guard);
        assert!(EventLoop::current().is_none());
    }

    #[test]
    fn run_sync_reports_elapsed_timeouts() {
        let event_loop = EventLoop::new().expect("loop");
        let outcome = event_loop.run_sync(
            async { tokio::time::sleep(Duration::from_secs(5)).await },
            Duration::from_millis(20),
        );
        assert!(outcome.is_err());
        let value = event_loop
            .run_sync(async { 7 }, Duration::from_secs(1))
            .expect("ready future completes");
        assert_eq!(value, 7);
    }
}
