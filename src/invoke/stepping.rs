//! Driving a test under a virtual clock.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::clock::VirtualClock;
use crate::error::Error;
use crate::reactor::Reactor;
use crate::task::{Deferred, Failure};

/// Steps `clock` until `task` completes.
///
/// Whenever the loop runs out of ready callbacks, the clock is advanced
/// exactly to its earliest pending call. If the task is not complete and no
/// call is pending, nothing can ever complete it, and the returned deferred
/// fails with [`Error::ReactorIdle`]. A delayed call panicking while the
/// clock advances fails it with that panic.
///
/// Must be called on the loop; the task's outcome is forwarded to the
/// returned deferred.
pub fn step_clock<T: Send + 'static>(
    reactor: &Arc<dyn Reactor>,
    clock: Arc<dyn VirtualClock>,
    task: Deferred<T>,
) -> Deferred<T> {
    let result = Deferred::new();
    let stepper = Arc::new(Stepper {
        reactor: Arc::clone(reactor),
        clock,
        done: AtomicBool::new(false),
        steps: AtomicUsize::new(0),
        result: result.clone(),
    });

    let finished = Arc::clone(&stepper);
    task.add_callback(move |outcome| {
        finished.done.store(true, Ordering::Release);
        let _ = finished.result.resolve(outcome);
    });
    stepper.schedule();
    result
}

struct Stepper<T> {
    reactor: Arc<dyn Reactor>,
    clock: Arc<dyn VirtualClock>,
    done: AtomicBool,
    steps: AtomicUsize,
    result: Deferred<T>,
}

impl<T: Send + 'static> Stepper<T> {
    fn schedule(self: &Arc<Self>) {
        let stepper = Arc::clone(self);
        self.reactor.call_when_idle(Box::new(move || stepper.step()));
    }

    fn step(self: &Arc<Self>) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        let Some(&next) = self.clock.pending_calls().first() else {
            tracing::warn!(
                steps = self.steps.load(Ordering::Relaxed),
                now = ?self.clock.now(),
                "reactor idle under clock stepping"
            );
            let _ = self.result.fail(Error::ReactorIdle);
            return;
        };
        let amount = next.saturating_sub(self.clock.now());
        let step = self.steps.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::trace!(step, ?amount, "advancing clock");
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| self.clock.advance(amount))) {
            tracing::warn!(step, "delayed call panicked under clock stepping");
            self.done.store(true, Ordering::Release);
            let _ = self.result.resolve(Err(Failure::Panic(payload)));
            return;
        }
        self.schedule();
    }
}
