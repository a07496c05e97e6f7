//! Inline-callback generators.
//!
//! An inline-callback routine is a resumable step function: each step either
//! yields a [`Deferred`] to wait on or returns the final value. The driver
//! registers a callback on every yielded deferred and resumes the routine
//! with its outcome from a fresh loop callback, so sequential-looking code
//! runs on the loop without native `async` syntax.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{raise, Deferred, Failure, Outcome, Value};
use crate::error::Result;
use crate::reactor::Reactor;

/// One step of an inline-callback generator.
pub enum InlineStep<T> {
    /// Wait for this deferred, then resume with its outcome.
    Yield(Deferred<Value>),
    /// Finish with this value.
    Return(T),
}

/// A generator driven by [`inline_callbacks`].
///
/// `resume` receives `None` on the first step and the outcome of the
/// previously yielded deferred afterwards. Errors are sent in as `Err`, so
/// the generator may handle them; returning `Err` fails the whole routine.
pub trait InlineGenerator: Send + 'static {
    /// The final value of the routine.
    type Output: Send + 'static;

    /// Advances the generator by one step.
    ///
    /// # Errors
    ///
    /// An error ends the routine with that error.
    fn resume(&mut self, sent: Option<Result<Value>>) -> Result<InlineStep<Self::Output>>;
}

impl<F, T> InlineGenerator for F
where
    F: FnMut(Option<Result<Value>>) -> Result<InlineStep<T>> + Send + 'static,
    T: Send + 'static,
{
    type Output = T;

    fn resume(&mut self, sent: Option<Result<Value>>) -> Result<InlineStep<T>> {
        self(sent)
    }
}

/// Runs `generator` on the reactor and returns the deferred of its result.
///
/// The first step runs synchronously on the calling thread; every later step
/// runs in a loop callback scheduled when the awaited deferred resolves.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use reactor_bridge::reactor::{EventLoop, Reactor, ReactorKind};
/// use reactor_bridge::task::{inline_callbacks, Deferred, InlineStep, Value};
/// use reactor_bridge::Result;
///
/// let reactor: Arc<dyn Reactor> = Arc::new(EventLoop::new(ReactorKind::Default));
/// let mut total = 0;
/// let deferred = inline_callbacks(&reactor, move |sent: Option<Result<Value>>| -> Result<InlineStep<i32>> {
///     if let Some(value) = sent {
///         total += *value?.downcast::<i32>().unwrap();
///     }
///     if total < 3 {
///         Ok(InlineStep::Yield(Deferred::succeeded(Box::new(1) as Value)))
///     } else {
///         Ok(InlineStep::Return(total))
///     }
/// });
///
/// let done = deferred.clone();
/// reactor.run_until(&|| done.is_resolved());
/// assert_eq!(deferred.wait().unwrap(), 3);
/// ```
pub fn inline_callbacks<G>(reactor: &Arc<dyn Reactor>, generator: G) -> Deferred<G::Output>
where
    G: InlineGenerator,
{
    let result = Deferred::new();
    let driver = Arc::new(Driver {
        generator: Mutex::new(generator),
        reactor: Arc::clone(reactor),
        result: result.clone(),
    });
    driver.step(None);
    result
}

struct Driver<G: InlineGenerator> {
    generator: Mutex<G>,
    reactor: Arc<dyn Reactor>,
    result: Deferred<G::Output>,
}

impl<G: InlineGenerator> Driver<G> {
    fn step(self: Arc<Self>, sent: Option<Outcome<Value>>) {
        let stepped = panic::catch_unwind(AssertUnwindSafe(|| {
            let sent = sent.map(raise);
            self.generator.lock().resume(sent)
        }));

        let finished = match stepped {
            Ok(Ok(InlineStep::Yield(deferred))) => {
                let driver = Arc::clone(&self);
                deferred.add_callback(move |outcome| {
                    let reactor = Arc::clone(&driver.reactor);
                    reactor.call_soon(Box::new(move || driver.step(Some(outcome))));
                });
                return;
            }
            Ok(Ok(InlineStep::Return(value))) => Ok(value),
            Ok(Err(error)) => Err(Failure::Error(error)),
            Err(payload) => Err(Failure::Panic(payload)),
        };
        let _ = self.result.resolve(finished);
    }
}
