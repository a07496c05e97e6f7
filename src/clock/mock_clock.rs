//! `MockClock` implementation for virtual time control.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use super::timer::{fire_all, Action, DelayedCall, MockSleep, TimerQueue};
use super::VirtualClock;

/// A mock clock that provides virtual time control for tests.
///
/// Time only moves when [`advance`](MockClock::advance) is called. Delayed
/// calls and sleeps registered on the clock come due as time passes their
/// deadlines; the clock never waits on real time.
///
/// # Thread Safety
///
/// `MockClock` is thread-safe and can be cloned and shared across threads.
/// All clones share the same underlying time state.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicBool, Ordering};
/// use std::time::Duration;
/// use reactor_bridge::clock::MockClock;
///
/// let clock = MockClock::new();
/// let fired = Arc::new(AtomicBool::new(false));
/// let flag = Arc::clone(&fired);
/// clock.call_later(Duration::from_secs(5), move || flag.store(true, Ordering::SeqCst));
/// assert_eq!(clock.pending_calls(), vec![Duration::from_secs(5)]);
///
/// clock.advance(Duration::from_secs(5));
/// assert!(fired.load(Ordering::SeqCst));
/// assert_eq!(clock.now(), Duration::from_secs(5));
/// ```
#[derive(Debug, Clone)]
pub struct MockClock {
    pub(crate) inner: Arc<ClockInner>,
}

#[derive(Debug)]
pub(crate) struct ClockInner {
    now: Mutex<Duration>,
    pub(crate) timers: Mutex<TimerQueue>,
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MockClock {
    /// Creates a new mock clock starting at time zero.
    #[must_use]
    pub fn new() -> Self {
        Self::with_start_time(Duration::ZERO)
    }

    /// Creates a new mock clock starting at the specified time.
    #[must_use]
    pub fn with_start_time(start: Duration) -> Self {
        Self {
            inner: Arc::new(ClockInner {
                now: Mutex::new(start),
                timers: Mutex::new(TimerQueue::default()),
            }),
        }
    }

    /// Returns the current virtual time.
    #[must_use]
    pub fn now(&self) -> Duration {
        *self.inner.now.lock()
    }

    /// Advances virtual time by `duration` and runs everything that came due.
    ///
    /// Delayed calls run on the calling thread in deadline order; sleeping
    /// futures are woken.
    pub fn advance(&self, duration: Duration) {
        let now = {
            let mut now = self.inner.now.lock();
            *now += duration;
            *now
        };
        let due = self.inner.timers.lock().take_expired(now);
        tracing::trace!(now = ?now, due = due.len(), "clock advanced");
        fire_all(due);
    }

    /// Schedules `callback` to run once virtual time has advanced by `delay`.
    pub fn call_later<F>(&self, delay: Duration, callback: F) -> DelayedCall
    where
        F: FnOnce() + Send + 'static,
    {
        let deadline = self.now() + delay;
        let key = self
            .inner
            .timers
            .lock()
            .insert(deadline, Action::Call(Box::new(callback)));
        DelayedCall::new(self.clone(), key)
    }

    /// Creates a future that completes after `duration` of virtual time.
    #[must_use]
    pub fn sleep(&self, duration: Duration) -> MockSleep {
        MockSleep::new(self.clone(), duration)
    }

    /// Deadlines of all pending delayed calls and registered sleeps, earliest
    /// first.
    #[must_use]
    pub fn pending_calls(&self) -> Vec<Duration> {
        self.inner.timers.lock().deadlines()
    }

    /// Returns the number of pending delayed calls and registered sleeps.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.timers.lock().len()
    }
}

impl VirtualClock for MockClock {
    fn now(&self) -> Duration {
        MockClock::now(self)
    }

    fn pending_calls(&self) -> Vec<Duration> {
        MockClock::pending_calls(self)
    }

    fn advance(&self, amount: Duration) {
        MockClock::advance(self, amount);
    }
}
