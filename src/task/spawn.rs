//! Futures running as tasks on a reactor.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};

use parking_lot::Mutex;

use super::{Deferred, Failure};
use crate::error::Result;
use crate::reactor::Reactor;

/// Unique identifier for a spawned task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

impl TaskId {
    /// Creates a new unique task ID.
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw ID value.
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Task({})", self.0)
    }
}

/// Type-erased boxed future.
type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

type PanicHandler = Box<dyn FnOnce(Box<dyn Any + Send>) + Send>;

/// Spawns a future on the reactor and returns the deferred it resolves.
///
/// The first poll is scheduled with [`Reactor::call_soon`], so the future only
/// makes progress while the loop is driven. Every wake schedules another poll
/// the same way. A panic while polling resolves the deferred with
/// [`Failure::Panic`].
///
/// May be called from any thread.
pub fn spawn<F, T>(reactor: &Arc<dyn Reactor>, future: F) -> Deferred<T>
where
    F: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let deferred = Deferred::new();
    let on_complete = deferred.clone();
    let on_panic = deferred.clone();

    let wrapped = async move {
        let outcome = future.await.map_err(Failure::Error);
        let _ = on_complete.resolve(outcome);
    };

    let task = Arc::new(Task {
        id: TaskId::new(),
        future: Mutex::new(Some(Box::pin(wrapped))),
        reactor: Arc::clone(reactor),
        scheduled: AtomicBool::new(false),
        polls: AtomicUsize::new(0),
        on_panic: Mutex::new(Some(Box::new(move |payload| {
            let _ = on_panic.resolve(Err(Failure::Panic(payload)));
        }))),
    });
    tracing::trace!(task = %task.id, "task spawned");
    task.schedule();
    deferred
}

/// Internal task representation.
struct Task {
    id: TaskId,
    future: Mutex<Option<BoxFuture>>,
    reactor: Arc<dyn Reactor>,
    /// Set while a poll is queued on the reactor.
    scheduled: AtomicBool,
    polls: AtomicUsize,
    on_panic: Mutex<Option<PanicHandler>>,
}

impl Task {
    fn schedule(self: &Arc<Self>) {
        if !self.scheduled.swap(true, Ordering::AcqRel) {
            let task = Arc::clone(self);
            self.reactor.call_soon(Box::new(move || task.run()));
        }
    }

    /// Polls the task once.
    fn run(self: &Arc<Self>) {
        self.scheduled.store(false, Ordering::Release);
        let Some(mut future) = self.future.lock().take() else {
            return;
        };
        self.polls.fetch_add(1, Ordering::Relaxed);

        let waker = Waker::from(Arc::clone(self));
        let mut cx = Context::from_waker(&waker);
        match panic::catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx))) {
            Ok(Poll::Ready(())) => {
                tracing::trace!(
                    task = %self.id,
                    polls = self.polls.load(Ordering::Relaxed),
                    "task completed"
                );
            }
            Ok(Poll::Pending) => {
                *self.future.lock() = Some(future);
            }
            Err(payload) => {
                tracing::debug!(task = %self.id, "task panicked");
                if let Some(handler) = self.on_panic.lock().take() {
                    handler(payload);
                }
            }
        }
    }
}

impl Wake for Task {
    fn wake(self: Arc<Self>) {
        self.schedule();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.schedule();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::reactor::{EventLoop, ReactorKind};

    fn reactor() -> Arc<dyn Reactor> {
        Arc::new(EventLoop::new(ReactorKind::Default))
    }

    fn drive<T>(reactor: &Arc<dyn Reactor>, deferred: &Deferred<T>) {
        let done = deferred.clone();
        reactor.run_until(&|| done.is_resolved());
    }

    /// Returns `Pending` once, waking itself, then `Ready`.
    struct YieldOnce(bool);

    impl Future for YieldOnce {
        type Output = ();

        fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
            if self.0 {
                Poll::Ready(())
            } else {
                self.0 = true;
                cx.waker().wake_by_ref();
                Poll::Pending
            }
        }
    }

    #[test]
    fn test_task_id_unique() {
        let id1 = TaskId::new();
        let id2 = TaskId::new();
        assert_ne!(id1, id2);
        assert!(id1 < id2);
        assert_eq!(id1.to_string(), format!("Task({})", id1.as_u64()));
    }

    #[test]
    fn test_spawn_does_not_run_until_driven() {
        let reactor = reactor();
        let deferred = spawn(&reactor, async { Ok(1) });
        assert!(!deferred.is_resolved());

        drive(&reactor, &deferred);
        assert_eq!(deferred.wait().unwrap(), 1);
    }

    #[test]
    fn test_spawn_self_waking_future() {
        let reactor = reactor();
        let deferred = spawn(&reactor, async {
            YieldOnce(false).await;
            YieldOnce(false).await;
            Ok("woken")
        });
        drive(&reactor, &deferred);
        assert_eq!(deferred.wait().unwrap(), "woken");
    }

    #[test]
    fn test_spawn_error_resolves_failure() {
        let reactor = reactor();
        let deferred: Deferred<()> = spawn(&reactor, async { Err(Error::ReactorIdle) });
        drive(&reactor, &deferred);
        assert!(matches!(
            deferred.wait(),
            Err(Failure::Error(Error::ReactorIdle))
        ));
    }

    #[test]
    fn test_spawn_panic_resolves_failure() {
        let reactor = reactor();
        let deferred: Deferred<()> = spawn(&reactor, async {
            if true {
                panic!("inside task");
            }
            Ok(())
        });
        drive(&reactor, &deferred);
        match deferred.wait() {
            Err(Failure::Panic(payload)) => {
                assert_eq!(*payload.downcast::<&str>().unwrap(), "inside task");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_task_awaits_deferred_resolved_by_callback() {
        let reactor = reactor();
        let gate: Deferred<u32> = Deferred::new();
        let awaited = gate.clone();
        let deferred = spawn(&reactor, async move { Ok(awaited.await? + 1) });

        let opener = gate.clone();
        reactor.call_soon(Box::new(move || opener.succeed(41).unwrap()));
        drive(&reactor, &deferred);
        assert_eq!(deferred.wait().unwrap(), 42);
    }
}
