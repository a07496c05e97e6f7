//! The loop fiber: the context the in-process loop runs in.

use std::fmt;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::reactor::{Reactor, RunExit};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FiberState {
    /// Control was never transferred into the loop.
    Unstarted,
    /// The loop ran and handed control back.
    Suspended,
    /// The loop stopped; no further transfers are possible.
    Dead,
}

/// The execution context of an in-process loop.
///
/// Switching into the fiber drives the loop on the calling thread until a
/// condition holds. The state lock is held for the whole switch, so at most
/// one thread is inside the fiber at a time.
pub(crate) struct LoopFiber {
    state: Mutex<FiberState>,
}

impl LoopFiber {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(FiberState::Unstarted),
        }
    }

    pub(crate) fn is_dead(&self) -> bool {
        *self.state.lock() == FiberState::Dead
    }

    /// Transfers control into the loop until `done` holds or the loop stops.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LoopStopped`] if the fiber is already dead.
    pub(crate) fn switch_until(&self, reactor: &dyn Reactor, done: &dyn Fn() -> bool) -> Result<RunExit> {
        let mut state = self.state.lock();
        if *state == FiberState::Dead {
            return Err(Error::LoopStopped);
        }
        tracing::trace!(kind = %reactor.kind(), from = ?*state, "switching into loop fiber");
        let exit = reactor.run_until(done);
        *state = match exit {
            RunExit::Done => FiberState::Suspended,
            RunExit::Stopped => {
                tracing::debug!(kind = %reactor.kind(), "loop fiber finished");
                FiberState::Dead
            }
        };
        Ok(exit)
    }

    /// Stops the loop and lets it unwind. Idempotent.
    ///
    /// A fiber that never started is marked dead without running the loop.
    pub(crate) fn shutdown(&self, reactor: &dyn Reactor) {
        let mut state = self.state.lock();
        match *state {
            FiberState::Dead => {}
            FiberState::Unstarted => {
                reactor.stop();
                *state = FiberState::Dead;
            }
            FiberState::Suspended => {
                reactor.stop();
                let exit = reactor.run_until(&|| false);
                debug_assert_eq!(exit, RunExit::Stopped);
                tracing::debug!(kind = %reactor.kind(), "loop fiber unwound");
                *state = FiberState::Dead;
            }
        }
    }
}

impl fmt::Debug for LoopFiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopFiber")
            .field("state", &*self.state.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::{EventLoop, ReactorKind};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_switch_runs_loop_until_done() {
        let reactor = EventLoop::new(ReactorKind::Default);
        let fiber = LoopFiber::new();
        let flag = Arc::new(AtomicBool::new(false));
        let f = Arc::clone(&flag);
        reactor.call_soon(Box::new(move || f.store(true, Ordering::SeqCst)));

        let exit = fiber.switch_until(&reactor, &|| flag.load(Ordering::SeqCst)).unwrap();
        assert_eq!(exit, RunExit::Done);
        assert!(!fiber.is_dead());
    }

    #[test]
    fn test_stop_inside_loop_kills_fiber() {
        let reactor = EventLoop::new(ReactorKind::Default);
        let fiber = LoopFiber::new();
        let stopper = reactor.clone();
        reactor.call_soon(Box::new(move || stopper.stop()));

        let exit = fiber.switch_until(&reactor, &|| false).unwrap();
        assert_eq!(exit, RunExit::Stopped);
        assert!(fiber.is_dead());
        assert!(matches!(
            fiber.switch_until(&reactor, &|| true),
            Err(Error::LoopStopped)
        ));
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let reactor = EventLoop::new(ReactorKind::Default);
        let fiber = LoopFiber::new();
        fiber.switch_until(&reactor, &|| true).unwrap();

        fiber.shutdown(&reactor);
        assert!(fiber.is_dead());
        assert!(reactor.is_stopped());
        fiber.shutdown(&reactor);
        assert!(fiber.is_dead());
    }

    #[test]
    fn test_shutdown_unstarted_does_not_drive() {
        let reactor = EventLoop::new(ReactorKind::Default);
        let fiber = LoopFiber::new();
        reactor.call_soon(Box::new(|| panic!("must not run")));

        fiber.shutdown(&reactor);
        assert!(fiber.is_dead());
        assert_eq!(reactor.dispatched_count(), 0);
    }
}
