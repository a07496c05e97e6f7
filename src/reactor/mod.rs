//! The event-loop interface and the process-wide reactor.
//!
//! The bridge needs very little from an event loop: a way to schedule a
//! zero-delay callback, a way to schedule work for when the loop runs out of
//! ready callbacks, a running flag, a stop operation, and a way to drive the
//! loop on the calling thread until some condition holds. Those operations
//! form the [`Reactor`] trait. [`EventLoop`] is the backend shipped with the
//! crate.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicBool, Ordering};
//! use reactor_bridge::reactor::{EventLoop, Reactor, ReactorKind, RunExit};
//!
//! let reactor = EventLoop::new(ReactorKind::Default);
//! let fired = Arc::new(AtomicBool::new(false));
//! let flag = Arc::clone(&fired);
//! reactor.call_soon(Box::new(move || flag.store(true, Ordering::SeqCst)));
//!
//! let exit = reactor.run_until(&|| fired.load(Ordering::SeqCst));
//! assert_eq!(exit, RunExit::Done);
//! ```

mod event_loop;
mod install;

use std::cell::Cell;
use std::fmt;
use std::str::FromStr;

pub use event_loop::{EventLoop, PumpHook};
pub(crate) use event_loop::panic_message;
pub use install::{install, install_custom, install_with_hooks, installed};

use crate::error::Error;

/// A callback scheduled on a reactor.
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

/// The event-loop backends the bridge can install.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReactorKind {
    /// The platform loop, driven from the thread that blocks on it.
    Default,
    /// A loop integrated with a UI toolkit's event processing through pump hooks.
    Ui,
    /// A loop running on its own thread, driven independently of the tests.
    External,
}

impl ReactorKind {
    /// Returns the configuration name of this kind.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            ReactorKind::Default => "default",
            ReactorKind::Ui => "ui",
            ReactorKind::External => "external",
        }
    }
}

impl fmt::Display for ReactorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ReactorKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "default" => Ok(ReactorKind::Default),
            "ui" => Ok(ReactorKind::Ui),
            "external" => Ok(ReactorKind::External),
            _ => Err(Error::UnknownReactor(s.to_string())),
        }
    }
}

/// Why [`Reactor::run_until`] returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunExit {
    /// The condition became true.
    Done,
    /// The reactor was stopped.
    Stopped,
}

/// The minimal event-loop interface consumed by the bridge.
///
/// All methods may be called from any thread. Callbacks only ever run on the
/// thread currently inside [`run_until`](Reactor::run_until).
pub trait Reactor: Send + Sync + 'static {
    /// The backend kind, used for installation compatibility checks.
    fn kind(&self) -> ReactorKind;

    /// Schedules a callback to run on the next loop iteration.
    fn call_soon(&self, callback: Callback);

    /// Schedules a callback to run once no other callback is ready.
    fn call_when_idle(&self, callback: Callback);

    /// Returns true while some thread is driving the loop.
    fn is_running(&self) -> bool;

    /// Returns true once [`stop`](Reactor::stop) was requested.
    fn is_stopped(&self) -> bool;

    /// Requests the loop to stop. Driving threads return [`RunExit::Stopped`].
    fn stop(&self);

    /// Drives the loop on the current thread until `done` returns true or the
    /// loop is stopped.
    ///
    /// `done` is checked before every dispatch; when nothing is ready the loop
    /// waits for callbacks scheduled from other threads.
    fn run_until(&self, done: &dyn Fn() -> bool) -> RunExit;

    /// Drives the loop until it is stopped.
    fn run(&self) {
        let _ = self.run_until(&|| false);
    }
}

thread_local! {
    static LOOP_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Returns true if the current thread is inside a loop dispatch.
///
/// This is the "current context is the loop fiber" test used to reject
/// reentrant blocking calls.
#[must_use]
pub fn in_loop_context() -> bool {
    LOOP_DEPTH.with(|depth| depth.get() > 0)
}

/// Marks the current thread as driving a loop until dropped.
pub(crate) struct LoopContextGuard {
    _private: (),
}

impl LoopContextGuard {
    pub(crate) fn enter() -> Self {
        LOOP_DEPTH.with(|depth| depth.set(depth.get() + 1));
        Self { _private: () }
    }
}

impl Drop for LoopContextGuard {
    fn drop(&mut self) {
        LOOP_DEPTH.with(|depth| depth.set(depth.get() - 1));
    }
}
