//! The `Deferred` result handle.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use super::{raise, Failure, Outcome};
use crate::error::{Error, Result};

/// A single-assignment container for the eventual result of an asynchronous
/// operation.
///
/// A deferred is resolved exactly once, with a value or a [`Failure`], and
/// hands its outcome to exactly one consumer: a callback registered with
/// [`add_callback`](Deferred::add_callback), a task awaiting it as a future,
/// or a thread blocked in [`wait`](Deferred::wait).
///
/// Clones share the same state; one clone is typically kept by the producer
/// and another handed to the consumer.
///
/// # Example
///
/// ```rust
/// use reactor_bridge::task::Deferred;
///
/// let deferred = Deferred::new();
/// deferred.succeed("done").unwrap();
///
/// deferred.add_callback(|outcome| {
///     assert_eq!(outcome.unwrap(), "done");
/// });
/// ```
pub struct Deferred<T> {
    shared: Arc<Shared<T>>,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    resolved: Condvar,
}

struct State<T> {
    outcome: Option<Outcome<T>>,
    consumer: Consumer<T>,
    fired: bool,
}

enum Consumer<T> {
    None,
    Callback(Box<dyn FnOnce(Outcome<T>) + Send + 'static>),
    Waker(Waker),
    Consumed,
}

impl<T> Deferred<T> {
    /// Creates an unresolved deferred.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    outcome: None,
                    consumer: Consumer::None,
                    fired: false,
                }),
                resolved: Condvar::new(),
            }),
        }
    }

    /// Creates a deferred already resolved with `value`.
    #[must_use]
    pub fn succeeded(value: T) -> Self {
        let deferred = Self::new();
        let _ = deferred.resolve(Ok(value));
        deferred
    }

    /// Creates a deferred already resolved with `failure`.
    #[must_use]
    pub fn failed(failure: impl Into<Failure>) -> Self {
        let deferred = Self::new();
        let _ = deferred.resolve(Err(failure.into()));
        deferred
    }

    /// Returns true once the deferred has been resolved.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.shared.state.lock().fired
    }

    /// Resolves the deferred with a value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyResolved`] if the deferred was already resolved.
    pub fn succeed(&self, value: T) -> Result<()> {
        self.resolve(Ok(value))
    }

    /// Resolves the deferred with a failure.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyResolved`] if the deferred was already resolved.
    pub fn fail(&self, failure: impl Into<Failure>) -> Result<()> {
        self.resolve(Err(failure.into()))
    }

    /// Resolves the deferred with an outcome and hands it to the consumer.
    ///
    /// A registered callback runs synchronously on the resolving thread.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyResolved`] if the deferred was already resolved.
    pub fn resolve(&self, outcome: Outcome<T>) -> Result<()> {
        let mut state = self.shared.state.lock();
        if state.fired {
            return Err(Error::AlreadyResolved);
        }
        state.fired = true;
        match std::mem::replace(&mut state.consumer, Consumer::None) {
            Consumer::Callback(callback) => {
                state.consumer = Consumer::Consumed;
                drop(state);
                callback(outcome);
            }
            Consumer::Waker(waker) => {
                state.outcome = Some(outcome);
                drop(state);
                waker.wake();
            }
            Consumer::None | Consumer::Consumed => {
                state.outcome = Some(outcome);
                self.shared.resolved.notify_all();
            }
        }
        Ok(())
    }

    /// Registers the consumer callback.
    ///
    /// If the deferred is already resolved the callback runs immediately on
    /// the calling thread; otherwise it runs on the thread that resolves it.
    ///
    /// # Panics
    ///
    /// Panics if the deferred already has a consumer.
    pub fn add_callback<F>(&self, callback: F)
    where
        F: FnOnce(Outcome<T>) + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        assert!(
            matches!(state.consumer, Consumer::None),
            "deferred already has a consumer"
        );
        if let Some(outcome) = state.outcome.take() {
            state.consumer = Consumer::Consumed;
            drop(state);
            callback(outcome);
        } else {
            assert!(!state.fired, "deferred outcome already consumed");
            state.consumer = Consumer::Callback(Box::new(callback));
        }
    }

    /// Returns a deferred resolved with `f` applied to this one's value.
    ///
    /// Failures pass through unchanged. Registers the callback consumer.
    pub fn map<U, F>(&self, f: F) -> Deferred<U>
    where
        T: 'static,
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let mapped = Deferred::new();
        let target = mapped.clone();
        self.add_callback(move |outcome| {
            let _ = target.resolve(outcome.map(f));
        });
        mapped
    }

    /// Blocks the calling thread until the deferred is resolved and returns
    /// its outcome.
    ///
    /// Only use this when the deferred is resolved by another thread.
    ///
    /// # Panics
    ///
    /// Panics if the outcome was already handed to another consumer.
    pub fn wait(&self) -> Outcome<T> {
        let mut state = self.shared.state.lock();
        loop {
            if let Some(outcome) = state.outcome.take() {
                state.consumer = Consumer::Consumed;
                return outcome;
            }
            assert!(
                !state.fired && matches!(state.consumer, Consumer::None),
                "deferred outcome already consumed"
            );
            self.shared.resolved.wait(&mut state);
        }
    }

    /// Like [`wait`](Deferred::wait), but gives up after `timeout`.
    ///
    /// Returns `None` if the deferred was not resolved in time.
    ///
    /// # Panics
    ///
    /// Panics if the outcome was already handed to another consumer.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Outcome<T>> {
        let mut state = self.shared.state.lock();
        if state.outcome.is_none() && !state.fired {
            self.shared.resolved.wait_for(&mut state, timeout);
        }
        let outcome = state.outcome.take();
        if outcome.is_some() {
            state.consumer = Consumer::Consumed;
        } else {
            assert!(!state.fired, "deferred outcome already consumed");
        }
        outcome
    }
}

impl<T> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("is_resolved", &self.is_resolved())
            .finish_non_exhaustive()
    }
}

/// Awaiting a deferred yields its value, returns its error, or resumes its
/// panic inside the awaiting task.
impl<T> Future for Deferred<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.shared.state.lock();
        if let Some(outcome) = state.outcome.take() {
            state.consumer = Consumer::Consumed;
            drop(state);
            return Poll::Ready(raise(outcome));
        }
        match &state.consumer {
            Consumer::None | Consumer::Waker(_) => {
                assert!(!state.fired, "deferred outcome already consumed");
                state.consumer = Consumer::Waker(cx.waker().clone());
                Poll::Pending
            }
            Consumer::Callback(_) | Consumer::Consumed => {
                panic!("deferred already has a consumer")
            }
        }
    }
}
