//! The blocking bridge between synchronous callers and the reactor.
//!
//! A [`Bridge`] is the process-wide context object: the installed reactor,
//! the optional loop fiber and the external-loop flag derived from them.
//! [`Bridge::block_on`] suspends the caller until a [`Deferred`] resolves,
//! using one of two strategies fixed when the bridge is created:
//!
//! - **In-process loop**: the reactor was not running, so the bridge owns a
//!   loop fiber and drives the loop on the calling thread until the result
//!   arrives.
//! - **External loop**: the reactor already runs on its own thread, so the
//!   bridge marshals callback registration onto that thread and waits.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use reactor_bridge::bridge::Bridge;
//! use reactor_bridge::reactor::{EventLoop, Reactor, ReactorKind};
//!
//! let reactor: Arc<dyn Reactor> = Arc::new(EventLoop::new(ReactorKind::Default));
//! let bridge = Bridge::new(reactor);
//! assert!(!bridge.is_external());
//!
//! let answer = bridge.run(async { Ok(6 * 7) }).unwrap();
//! assert_eq!(answer, 42);
//! bridge.shutdown();
//! ```

mod config;
mod fiber;

use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

pub use config::{BridgeConfig, REACTOR_ENV};
use fiber::LoopFiber;

use crate::error::{Error, Result};
use crate::reactor::{self, in_loop_context, Reactor, RunExit};
use crate::task::{raise, spawn, Deferred, Failure, Outcome};

/// How often an external-mode wait re-checks that the loop is still running.
const EXTERNAL_POLL_INTERVAL: Duration = Duration::from_millis(50);

static GLOBAL: Mutex<Option<Arc<Bridge>>> = Mutex::new(None);

/// The context object every blocking call goes through.
pub struct Bridge {
    reactor: Arc<dyn Reactor>,
    /// `None` in external-loop mode.
    fiber: Option<LoopFiber>,
}

impl Bridge {
    /// Creates a bridge over `reactor`.
    ///
    /// If the reactor is not running, the bridge creates a loop fiber and
    /// drives the loop itself; otherwise it works in external-loop mode.
    #[must_use]
    pub fn new(reactor: Arc<dyn Reactor>) -> Self {
        let fiber = if reactor.is_running() {
            tracing::debug!(kind = %reactor.kind(), "reactor already running, using external loop mode");
            None
        } else {
            tracing::debug!(kind = %reactor.kind(), "loop fiber created");
            Some(LoopFiber::new())
        };
        Self { reactor, fiber }
    }

    /// Installs the reactor selected by `config` and the process-wide bridge.
    ///
    /// The configured pump hooks are attached to a freshly installed UI
    /// reactor.
    ///
    /// Repeated calls with a compatible configuration return the existing
    /// bridge.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WrongReactorAlreadyInstalled`] if another reactor
    /// kind is installed, or the error raised while starting the reactor.
    pub fn install(config: &BridgeConfig) -> Result<Arc<Bridge>> {
        let mut global = GLOBAL.lock();
        let reactor = reactor::install_with_hooks(config.reactor_kind(), config.pump_hooks())?;
        if let Some(bridge) = global.as_ref() {
            return Ok(Arc::clone(bridge));
        }
        let bridge = Arc::new(Bridge::new(reactor));
        *global = Some(Arc::clone(&bridge));
        Ok(bridge)
    }

    /// Returns the process-wide bridge, installing it from
    /// [`BridgeConfig::from_env`] on first use.
    ///
    /// # Errors
    ///
    /// Returns the configuration or installation error of the first use.
    pub fn global() -> Result<Arc<Bridge>> {
        if let Some(bridge) = GLOBAL.lock().as_ref() {
            return Ok(Arc::clone(bridge));
        }
        Self::install(&BridgeConfig::from_env()?)
    }

    /// Returns the reactor this bridge drives or marshals onto.
    #[must_use]
    pub fn reactor(&self) -> &Arc<dyn Reactor> {
        &self.reactor
    }

    /// Returns true if the loop runs outside this bridge's control.
    #[must_use]
    pub fn is_external(&self) -> bool {
        self.fiber.is_none()
    }

    /// Suspends the caller until `deferred` resolves.
    ///
    /// Returns the value, returns the error, or resumes the panic the
    /// deferred failed with.
    ///
    /// # Errors
    ///
    /// Returns the deferred's error, [`Error::LoopStopped`] if the in-process
    /// loop has stopped, or [`Error::LoopNotRunning`] if the external loop is
    /// not running.
    ///
    /// # Panics
    ///
    /// Panics when called from inside the loop, since the loop could never
    /// make progress on the result.
    pub fn block_on<T: Send + 'static>(&self, deferred: Deferred<T>) -> Result<T> {
        match &self.fiber {
            Some(fiber) => self.block_in_process(fiber, deferred),
            None => self.block_external(deferred),
        }
    }

    fn block_in_process<T: Send + 'static>(&self, fiber: &LoopFiber, deferred: Deferred<T>) -> Result<T> {
        assert!(
            !in_loop_context(),
            "block_on cannot be called from the loop fiber"
        );
        if fiber.is_dead() {
            return Err(Error::LoopStopped);
        }

        let cell: Arc<Mutex<Option<Outcome<T>>>> = Arc::new(Mutex::new(None));
        let filler = Arc::clone(&cell);
        let waker = Arc::clone(&self.reactor);
        deferred.add_callback(move |outcome| {
            *filler.lock() = Some(outcome);
            if !in_loop_context() {
                // Resolved off-loop: wake the driving thread so it sees the result.
                waker.call_soon(Box::new(|| {}));
            }
        });

        let exit = if cell.lock().is_some() {
            RunExit::Done
        } else {
            fiber.switch_until(self.reactor.as_ref(), &|| cell.lock().is_some())?
        };

        let outcome = cell.lock().take();
        match (outcome, exit) {
            (Some(outcome), _) => raise(outcome),
            (None, RunExit::Stopped) => Err(Error::LoopStopped),
            (None, RunExit::Done) => panic!("illegal switch: loop fiber returned without a result"),
        }
    }

    fn block_external<T: Send + 'static>(&self, deferred: Deferred<T>) -> Result<T> {
        if !self.reactor.is_running() {
            return Err(Error::LoopNotRunning);
        }
        assert!(
            !in_loop_context(),
            "block_on cannot be called from the loop thread"
        );

        let waiter = Deferred::new();
        let relay = waiter.clone();
        self.reactor.call_soon(Box::new(move || {
            deferred.add_callback(move |outcome| {
                let _ = relay.resolve(outcome);
            });
        }));

        loop {
            if let Some(outcome) = waiter.wait_timeout(EXTERNAL_POLL_INTERVAL) {
                return raise(outcome);
            }
            if !self.reactor.is_running() {
                tracing::warn!(kind = %self.reactor.kind(), "external loop stopped while waiting");
                return Err(Error::LoopNotRunning);
            }
        }
    }

    /// Runs `f` on the loop and blocks until the deferred it returns resolves.
    ///
    /// `f` is scheduled as a zero-delay callback. An error or panic raised by
    /// `f` itself is reported the same way as a failure of its deferred.
    ///
    /// # Errors
    ///
    /// Returns the error of `f` or of its deferred, or the errors of
    /// [`block_on`](Bridge::block_on).
    pub fn call<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Arc<dyn Reactor>) -> Result<Deferred<T>> + Send + 'static,
        T: Send + 'static,
    {
        let outer = Deferred::new();
        let result = outer.clone();
        let reactor = Arc::clone(&self.reactor);
        self.reactor.call_soon(Box::new(move || {
            match panic::catch_unwind(AssertUnwindSafe(|| f(&reactor))) {
                Ok(Ok(inner)) => inner.add_callback(move |outcome| {
                    let _ = result.resolve(outcome);
                }),
                Ok(Err(error)) => {
                    let _ = result.fail(error);
                }
                Err(payload) => {
                    let _ = result.resolve(Err(Failure::Panic(payload)));
                }
            }
        }));
        self.block_on(outer)
    }

    /// Runs `future` as a task on the loop and blocks until it completes.
    ///
    /// # Errors
    ///
    /// Returns the future's error, or the errors of
    /// [`block_on`](Bridge::block_on).
    pub fn run<F, T>(&self, future: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.call(move |reactor| Ok(spawn(reactor, future)))
    }

    /// Stops the in-process loop and lets it unwind. Idempotent.
    ///
    /// An external loop is left alone; its owner stops it.
    pub fn shutdown(&self) {
        match &self.fiber {
            Some(fiber) => fiber.shutdown(self.reactor.as_ref()),
            None => tracing::trace!("external loop mode, nothing to shut down"),
        }
    }
}

impl fmt::Debug for Bridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bridge")
            .field("kind", &self.reactor.kind())
            .field("fiber", &self.fiber)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::{EventLoop, ReactorKind};
    use std::thread;

    fn in_process() -> Bridge {
        Bridge::new(Arc::new(EventLoop::new(ReactorKind::Default)))
    }

    fn external() -> (EventLoop, Bridge) {
        let reactor = EventLoop::spawn_thread(ReactorKind::External).unwrap();
        let bridge = Bridge::new(Arc::new(reactor.clone()));
        (reactor, bridge)
    }

    #[test]
    fn test_mode_is_fixed_at_construction() {
        assert!(!in_process().is_external());
        let (reactor, bridge) = external();
        assert!(bridge.is_external());
        reactor.stop_and_join();
    }

    #[test]
    fn test_block_on_resolved_deferred_does_not_drive() {
        let bridge = in_process();
        assert_eq!(bridge.block_on(Deferred::succeeded(7)).unwrap(), 7);
    }

    #[test]
    fn test_block_on_resolved_later_on_loop() {
        let bridge = in_process();
        let deferred = Deferred::new();
        let producer = deferred.clone();
        bridge
            .reactor()
            .call_soon(Box::new(move || producer.succeed("late").unwrap()));
        assert_eq!(bridge.block_on(deferred).unwrap(), "late");
    }

    #[test]
    fn test_block_on_resolved_from_other_thread() {
        let bridge = in_process();
        let deferred = Deferred::new();
        let producer = deferred.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.succeed(3).unwrap();
        });
        assert_eq!(bridge.block_on(deferred).unwrap(), 3);
        handle.join().unwrap();
    }

    #[test]
    fn test_block_on_returns_error() {
        let bridge = in_process();
        let result = bridge.run(async { Err::<(), _>(Error::body("boom")) });
        assert_eq!(result.unwrap_err().to_string(), "boom");
    }

    #[test]
    #[should_panic(expected = "kaboom")]
    fn test_block_on_resumes_panic() {
        let bridge = in_process();
        let _ = bridge.call(|_| -> Result<Deferred<()>> { panic!("kaboom") });
    }

    #[test]
    #[should_panic(expected = "block_on cannot be called from the loop fiber")]
    fn test_reentrant_block_on_panics() {
        let bridge = Arc::new(in_process());
        let inner = Arc::clone(&bridge);
        let _ = bridge.call(move |_| Ok(Deferred::succeeded(inner.block_on(Deferred::<()>::new()))));
    }

    #[test]
    fn test_block_on_after_shutdown() {
        let bridge = in_process();
        bridge.run(async { Ok(()) }).unwrap();
        bridge.shutdown();
        bridge.shutdown();
        assert!(matches!(
            bridge.block_on(Deferred::<()>::new()),
            Err(Error::LoopStopped)
        ));
    }

    #[test]
    fn test_loop_stopped_while_waiting() {
        let bridge = in_process();
        let reactor = Arc::clone(bridge.reactor());
        let result = bridge.call(move |_| {
            reactor.stop();
            Ok(Deferred::<()>::new())
        });
        assert!(matches!(result, Err(Error::LoopStopped)));
    }

    #[test]
    fn test_external_call_runs_on_loop_thread() {
        let (reactor, bridge) = external();
        let name = bridge
            .call(|_| Ok(Deferred::succeeded(thread::current().name().map(String::from))))
            .unwrap();
        assert_eq!(name.as_deref(), Some("reactor-external"));

        assert_eq!(bridge.run(async { Ok(5) }).unwrap(), 5);
        reactor.stop_and_join();
    }

    #[test]
    fn test_external_not_running() {
        let (reactor, bridge) = external();
        reactor.stop_and_join();
        assert!(matches!(
            bridge.block_on(Deferred::<()>::new()),
            Err(Error::LoopNotRunning)
        ));
    }
}
