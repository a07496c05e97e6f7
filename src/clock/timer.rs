//! Delayed calls and sleep futures on virtual time.

use pin_project::{pin_project, pinned_drop};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use super::MockClock;

/// Orders timers by deadline, then by registration order.
pub(crate) type TimerKey = (Duration, u64);

/// What happens when a timer comes due.
pub(crate) enum Action {
    /// Wake a sleeping future.
    Wake(Option<Waker>),
    /// Run a delayed call.
    Call(Box<dyn FnOnce() + Send + 'static>),
}

impl Action {
    fn fire(self) {
        match self {
            Action::Wake(waker) => {
                if let Some(waker) = waker {
                    waker.wake();
                }
            }
            Action::Call(callback) => callback(),
        }
    }
}

/// Pending timers of one clock.
#[derive(Default)]
pub(crate) struct TimerQueue {
    pending: BTreeMap<TimerKey, Action>,
    next_id: u64,
}

impl TimerQueue {
    pub(crate) fn insert(&mut self, deadline: Duration, action: Action) -> TimerKey {
        let key = (deadline, self.next_id);
        self.next_id += 1;
        self.pending.insert(key, action);
        key
    }

    pub(crate) fn remove(&mut self, key: TimerKey) -> bool {
        self.pending.remove(&key).is_some()
    }

    fn set_waker(&mut self, key: TimerKey, waker: &Waker) {
        if let Some(Action::Wake(slot)) = self.pending.get_mut(&key) {
            match slot {
                Some(existing) if existing.will_wake(waker) => {}
                _ => *slot = Some(waker.clone()),
            }
        }
    }

    /// Deadlines of all pending timers, earliest first.
    pub(crate) fn deadlines(&self) -> Vec<Duration> {
        self.pending.keys().map(|(deadline, _)| *deadline).collect()
    }

    /// Removes every timer due at `now`, earliest first.
    pub(crate) fn take_expired(&mut self, now: Duration) -> Vec<Action> {
        let later = self.pending.split_off(&(now, u64::MAX));
        let due = std::mem::replace(&mut self.pending, later);
        due.into_values().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }
}

impl fmt::Debug for TimerQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerQueue")
            .field("deadlines", &self.deadlines())
            .finish()
    }
}

/// Runs expired actions outside any clock lock.
///
/// A panicking delayed call does not stop the others: every action fires,
/// then the first panic resumes.
pub(crate) fn fire_all(actions: Vec<Action>) {
    let mut first_panic = None;
    for action in actions {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| action.fire())) {
            first_panic.get_or_insert(payload);
        }
    }
    if let Some(payload) = first_panic {
        panic::resume_unwind(payload);
    }
}

/// Handle to a call scheduled with [`MockClock::call_later`].
#[derive(Debug, Clone)]
pub struct DelayedCall {
    clock: MockClock,
    key: TimerKey,
}

impl DelayedCall {
    pub(crate) fn new(clock: MockClock, key: TimerKey) -> Self {
        Self { clock, key }
    }

    /// Returns the virtual time the call is due at.
    #[must_use]
    pub fn deadline(&self) -> Duration {
        self.key.0
    }

    /// Returns true while the call has neither run nor been cancelled.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.clock.inner.timers.lock().pending.contains_key(&self.key)
    }

    /// Cancels the call. Returns false if it already ran or was cancelled.
    pub fn cancel(&self) -> bool {
        self.clock.inner.timers.lock().remove(self.key)
    }
}

/// A future that completes when virtual time reaches its deadline.
///
/// Created by [`MockClock::sleep`]. The sleep registers itself as a pending
/// timer on first poll and unregisters when dropped.
#[pin_project(PinnedDrop)]
pub struct MockSleep {
    clock: MockClock,
    deadline: Duration,
    key: Option<TimerKey>,
}

impl MockSleep {
    pub(crate) fn new(clock: MockClock, duration: Duration) -> Self {
        let deadline = clock.now() + duration;
        Self {
            clock,
            deadline,
            key: None,
        }
    }

    /// Returns the deadline for this sleep.
    #[must_use]
    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Returns `true` if this sleep has completed.
    #[must_use]
    pub fn is_elapsed(&self) -> bool {
        self.clock.now() >= self.deadline
    }
}

impl Future for MockSleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let mut timers = this.clock.inner.timers.lock();
        if this.clock.now() >= *this.deadline {
            if let Some(key) = this.key.take() {
                timers.remove(key);
            }
            return Poll::Ready(());
        }
        match *this.key {
            Some(key) => timers.set_waker(key, cx.waker()),
            None => {
                let key = timers.insert(*this.deadline, Action::Wake(Some(cx.waker().clone())));
                *this.key = Some(key);
            }
        }
        Poll::Pending
    }
}

#[pinned_drop]
impl PinnedDrop for MockSleep {
    fn drop(self: Pin<&mut Self>) {
        let this = self.project();
        if let Some(key) = this.key.take() {
            this.clock.inner.timers.lock().remove(key);
        }
    }
}

impl fmt::Debug for MockSleep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockSleep")
            .field("deadline", &self.deadline)
            .field("registered", &self.key.is_some())
            .finish()
    }
}
