//! The `EventLoop` backend.

use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use super::{Callback, LoopContextGuard, Reactor, ReactorKind, RunExit};

/// How long an idle loop sleeps before running its pump hooks again.
const PUMP_INTERVAL: Duration = Duration::from_millis(10);

/// A hook run on every loop iteration of a [`ReactorKind::Ui`] loop.
pub type PumpHook = Arc<dyn Fn() + Send + Sync + 'static>;

/// A single-threaded, callback-driven event loop.
///
/// Callbacks are queued from any thread and dispatched in FIFO order by
/// whichever thread drives the loop through [`Reactor::run_until`]. Idle
/// callbacks run only when the ready queue is empty.
///
/// `EventLoop` is cheap to clone; all clones share the same queues.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use parking_lot::Mutex;
/// use reactor_bridge::reactor::{EventLoop, Reactor, ReactorKind};
///
/// let reactor = EventLoop::new(ReactorKind::Default);
/// let order = Arc::new(Mutex::new(Vec::new()));
///
/// let o = Arc::clone(&order);
/// reactor.call_when_idle(Box::new(move || o.lock().push("idle")));
/// let o = Arc::clone(&order);
/// reactor.call_soon(Box::new(move || o.lock().push("ready")));
///
/// let seen = Arc::clone(&order);
/// reactor.run_until(&|| seen.lock().len() == 2);
/// assert_eq!(*order.lock(), vec!["ready", "idle"]);
/// ```
#[derive(Clone)]
pub struct EventLoop {
    inner: Arc<LoopInner>,
}

struct LoopInner {
    kind: ReactorKind,
    queues: Mutex<Queues>,
    /// Signalled whenever a callback is queued or a stop is requested.
    wakeup: Condvar,
    running: AtomicBool,
    stopped: AtomicBool,
    pumps: Mutex<Vec<PumpHook>>,
    dispatched: AtomicU64,
    thread: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Default)]
struct Queues {
    ready: VecDeque<Callback>,
    idle: VecDeque<Callback>,
}

impl EventLoop {
    /// Creates a loop of the given kind. The loop does not run until driven.
    #[must_use]
    pub fn new(kind: ReactorKind) -> Self {
        Self {
            inner: Arc::new(LoopInner {
                kind,
                queues: Mutex::new(Queues::default()),
                wakeup: Condvar::new(),
                running: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                pumps: Mutex::new(Vec::new()),
                dispatched: AtomicU64::new(0),
                thread: Mutex::new(None),
            }),
        }
    }

    /// Creates a loop and starts driving it on a dedicated thread.
    ///
    /// The returned loop already reports [`is_running`](Reactor::is_running).
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the thread could not be spawned.
    pub fn spawn_thread(kind: ReactorKind) -> std::io::Result<Self> {
        let reactor = Self::new(kind);
        reactor.inner.running.store(true, Ordering::SeqCst);
        let driver = reactor.clone();
        let handle = thread::Builder::new()
            .name(format!("reactor-{kind}"))
            .spawn(move || driver.run())
            .inspect_err(|_| reactor.inner.running.store(false, Ordering::SeqCst))?;
        *reactor.inner.thread.lock() = Some(handle);
        tracing::debug!(%kind, "event loop thread started");
        Ok(reactor)
    }

    /// Adds a hook invoked on every loop iteration.
    ///
    /// UI toolkits use this to process their own pending events while the
    /// loop is driven.
    pub fn add_pump_hook(&self, hook: PumpHook) {
        self.inner.pumps.lock().push(hook);
    }

    /// Returns the number of callbacks waiting to run, idle ones included.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        let queues = self.inner.queues.lock();
        queues.ready.len() + queues.idle.len()
    }

    /// Returns the total number of callbacks dispatched so far.
    #[must_use]
    pub fn dispatched_count(&self) -> u64 {
        self.inner.dispatched.load(Ordering::Relaxed)
    }

    /// Stops the loop and waits for its dedicated thread, if it has one.
    pub fn stop_and_join(&self) {
        self.stop();
        let handle = self.inner.thread.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!(kind = %self.inner.kind, "event loop thread panicked");
            }
        }
    }

    /// Runs the pump hooks from a snapshot, so a hook may add hooks.
    fn pump(&self) {
        let hooks = self.inner.pumps.lock().clone();
        for hook in hooks {
            hook();
        }
    }

    /// Pops the next callback: ready ones first, then idle ones.
    fn next_callback(&self) -> Option<Callback> {
        let mut queues = self.inner.queues.lock();
        queues.ready.pop_front().or_else(|| queues.idle.pop_front())
    }

    fn dispatch(&self, callback: Callback) {
        self.inner.dispatched.fetch_add(1, Ordering::Relaxed);
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(callback)) {
            tracing::error!(
                kind = %self.inner.kind,
                panic = panic_message(payload.as_ref()),
                "unhandled panic in loop callback"
            );
        }
    }

    fn wait_for_work(&self) {
        let has_pumps = !self.inner.pumps.lock().is_empty();
        let mut queues = self.inner.queues.lock();
        if queues.ready.is_empty() && queues.idle.is_empty() && !self.is_stopped() {
            if has_pumps {
                self.inner.wakeup.wait_for(&mut queues, PUMP_INTERVAL);
            } else {
                self.inner.wakeup.wait(&mut queues);
            }
        }
    }

    fn push(&self, callback: Callback, idle: bool) {
        let mut queues = self.inner.queues.lock();
        if idle {
            queues.idle.push_back(callback);
        } else {
            queues.ready.push_back(callback);
        }
        self.inner.wakeup.notify_all();
    }
}

impl Reactor for EventLoop {
    fn kind(&self) -> ReactorKind {
        self.inner.kind
    }

    fn call_soon(&self, callback: Callback) {
        self.push(callback, false);
    }

    fn call_when_idle(&self, callback: Callback) {
        self.push(callback, true);
    }

    fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        let _queues = self.inner.queues.lock();
        self.inner.wakeup.notify_all();
    }

    fn run_until(&self, done: &dyn Fn() -> bool) -> RunExit {
        let _context = LoopContextGuard::enter();
        self.inner.running.store(true, Ordering::SeqCst);
        let exit = loop {
            if done() {
                break RunExit::Done;
            }
            if self.is_stopped() {
                break RunExit::Stopped;
            }
            self.pump();
            match self.next_callback() {
                Some(callback) => self.dispatch(callback),
                None => self.wait_for_work(),
            }
        };
        self.inner.running.store(false, Ordering::SeqCst);
        tracing::trace!(kind = %self.inner.kind, ?exit, "loop returned control");
        exit
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("kind", &self.inner.kind)
            .field("pending", &self.pending_count())
            .field("running", &self.is_running())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Extracts a printable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic payload>"
    }
}
