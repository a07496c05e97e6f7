//! The test invoker.
//!
//! A [`TestFn`] is a test body plus its declared parameter names. The
//! constructors tag it with the [`Mark`] that decides how its result is
//! awaited; [`TestInvoker::call`] resolves the declared arguments, runs the
//! body on the loop through the [`Bridge`] and hands the outcome back to the
//! harness as an ordinary `Result`.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use reactor_bridge::bridge::Bridge;
//! use reactor_bridge::invoke::{Funcargs, TestFn, TestInvoker};
//! use reactor_bridge::fixture::FixtureValue;
//! use reactor_bridge::reactor::{EventLoop, ReactorKind};
//!
//! let bridge = Bridge::new(Arc::new(EventLoop::new(ReactorKind::Default)));
//! let test = TestFn::coroutine("test_add", ["x"], |args| async move {
//!     Ok(args.get::<i32>("x")? + 1)
//! });
//!
//! let mut funcargs = Funcargs::new();
//! funcargs.insert("x", FixtureValue::new(41_i32));
//! let value = TestInvoker::call(&bridge, &test, &funcargs).unwrap();
//! assert_eq!(*value.downcast::<i32>().unwrap(), 42);
//! ```

mod stepping;

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

pub use stepping::step_clock;

use crate::bridge::Bridge;
use crate::clock::VirtualClock;
use crate::error::{Error, Result};
use crate::fixture::{Args, BoxFuture, FixtureDef, FixtureValue};
use crate::mark::{self, CallableId, Mark};
use crate::task::{inline_callbacks, spawn, Deferred, InlineGenerator, Value};

/// What a test body handed back.
pub enum Returned {
    /// A deferred handle to await.
    Deferred(Deferred<Value>),
    /// A future to run as a task.
    Coroutine(BoxFuture<Value>),
    /// An immediate result.
    Ready(Result<Value>),
}

impl fmt::Debug for Returned {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Returned::Deferred(deferred) => f.debug_tuple("Deferred").field(deferred).finish(),
            Returned::Coroutine(_) => f.write_str("Coroutine(..)"),
            Returned::Ready(result) => f.debug_tuple("Ready").field(&result.is_ok()).finish(),
        }
    }
}

type TestBody = Arc<dyn Fn(Args) -> Returned + Send + Sync>;

/// A test: its body, declared parameter names and identity.
#[derive(Clone)]
pub struct TestFn {
    id: CallableId,
    name: String,
    params: Vec<String>,
    body: TestBody,
}

fn names<I, S>(params: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    params.into_iter().map(Into::into).collect()
}

fn erase<T: Any + Send>(value: T) -> Value {
    Box::new(value)
}

impl TestFn {
    /// Creates an unmarked test from a raw body.
    pub fn new<I, S, F>(name: impl Into<String>, params: I, body: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(Args) -> Returned + Send + Sync + 'static,
    {
        Self {
            id: CallableId::new(),
            name: name.into(),
            params: names(params),
            body: Arc::new(body),
        }
    }

    fn tagged(self, mark: Mark) -> Self {
        mark::mark_new(self.id, mark);
        self
    }

    /// A test written as a future. Runs under clock stepping when it depends
    /// on an auto-clock fixture.
    pub fn coroutine<I, S, F, Fut, T>(name: impl Into<String>, params: I, body: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Any + Send,
    {
        Self::new(name, params, move |args| {
            let future = body(args);
            Returned::Coroutine(Box::pin(async move { future.await.map(erase) }))
        })
        .tagged(Mark::CoroutineTest)
    }

    /// A test written as an inline-callback generator.
    ///
    /// `factory` builds a fresh generator from the test's arguments; invoking
    /// the test runs it with [`inline_callbacks`] on the loop.
    pub fn inline_callbacks<I, S, F, G>(name: impl Into<String>, params: I, factory: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(Args) -> G + Send + Sync + 'static,
        G: InlineGenerator,
        G::Output: Any,
    {
        Self::new(name, params, move |args| {
            let reactor = Arc::clone(args.reactor());
            Returned::Deferred(inline_callbacks(&reactor, factory(args)).map(erase))
        })
        .tagged(Mark::InlineCallbackTest)
    }

    /// An unmarked test returning a deferred handle.
    pub fn deferred<I, S, F, T>(name: impl Into<String>, params: I, body: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(Args) -> Deferred<T> + Send + Sync + 'static,
        T: Any + Send,
    {
        Self::new(name, params, move |args| Returned::Deferred(body(args).map(erase)))
    }

    /// A test returning a deferred handle, explicitly marked as such.
    pub fn plain_deferred<I, S, F, T>(name: impl Into<String>, params: I, body: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(Args) -> Deferred<T> + Send + Sync + 'static,
        T: Any + Send,
    {
        Self::deferred(name, params, body).tagged(Mark::PlainDeferred)
    }

    /// An unmarked test returning its result directly.
    pub fn sync<I, S, F, T>(name: impl Into<String>, params: I, body: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(Args) -> Result<T> + Send + Sync + 'static,
        T: Any + Send,
    {
        Self::new(name, params, move |args| Returned::Ready(body(args).map(erase)))
    }

    /// Attaches `mark` to this test.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MarkConflict`] if the test already carries another
    /// mark.
    pub fn mark(self, mark: Mark) -> Result<Self> {
        mark::set_mark(self.id, &self.name, mark)?;
        Ok(self)
    }

    /// Returns the identity the test's mark is keyed by.
    #[must_use]
    pub fn id(&self) -> CallableId {
        self.id
    }

    /// Returns the test name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the declared parameter names.
    #[must_use]
    pub fn params(&self) -> &[String] {
        &self.params
    }

    /// Returns the test's mark.
    #[must_use]
    pub fn get_mark(&self) -> Option<Mark> {
        mark::get_mark(self.id)
    }
}

impl fmt::Debug for TestFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestFn")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("params", &self.params)
            .field("mark", &self.get_mark())
            .finish_non_exhaustive()
    }
}

struct Funcarg {
    name: String,
    value: FixtureValue,
    def: Option<Arc<FixtureDef>>,
}

/// Every fixture value the harness set up for a test, by name.
///
/// Only the ones named by the test's parameters are passed to it; the
/// others are scanned for auto-clock fixtures.
#[derive(Default)]
pub struct Funcargs {
    entries: Vec<Funcarg>,
}

impl Funcargs {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a plain value.
    pub fn insert(&mut self, name: impl Into<String>, value: FixtureValue) {
        self.entries.push(Funcarg {
            name: name.into(),
            value,
            def: None,
        });
    }

    /// Adds the value of the fixture `def`.
    pub fn insert_fixture(&mut self, def: &Arc<FixtureDef>, value: FixtureValue) {
        self.entries.push(Funcarg {
            name: def.name().to_string(),
            value,
            def: Some(Arc::clone(def)),
        });
    }

    /// Returns the value named `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&FixtureValue> {
        self.entries
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| &entry.value)
    }

    /// Returns the clock of the first fixture flagged as having one.
    #[must_use]
    pub fn clock(&self) -> Option<Arc<dyn VirtualClock>> {
        self.entries
            .iter()
            .filter(|entry| entry.def.as_ref().is_some_and(|def| def.has_clock()))
            .find_map(|entry| entry.value.clock().cloned())
    }

    /// Returns the number of values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if there are no values.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for Funcargs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|entry| &entry.name))
            .finish()
    }
}

/// Runs tests on the loop and converts their outcome into a `Result`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TestInvoker;

impl TestInvoker {
    /// Invokes `test` with the arguments it declares, taken from `funcargs`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingArgument`] for an undeclared argument,
    /// [`Error::UnrecognizedMark`] for a fixture mark,
    /// [`Error::MarkMismatch`] if the body does not match its mark,
    /// [`Error::ReactorIdle`] if clock stepping stalls, the test's own error,
    /// or the errors of [`Bridge::block_on`].
    ///
    /// # Panics
    ///
    /// A panic in the test body resumes in the caller with its original
    /// payload.
    pub fn call(bridge: &Bridge, test: &TestFn, funcargs: &Funcargs) -> Result<Value> {
        let values = test
            .params()
            .iter()
            .map(|name| {
                funcargs
                    .get(name)
                    .map(|value| (name.clone(), value.clone()))
                    .ok_or_else(|| Error::MissingArgument(name.clone()))
            })
            .collect::<Result<Vec<_>>>()?;
        let args = Args::new(Arc::clone(bridge.reactor()), values);

        let mark = test.get_mark();
        if let Some(mark) = mark.filter(|mark| mark.is_fixture()) {
            return Err(Error::UnrecognizedMark {
                name: test.name().to_string(),
                mark,
            });
        }
        let clock = match mark {
            Some(Mark::CoroutineTest) => funcargs.clock(),
            _ => None,
        };
        tracing::debug!(test = test.name(), ?mark, clock = clock.is_some(), "invoking test");

        let body = Arc::clone(&test.body);
        let name = test.name().to_string();
        bridge.call(move |reactor| match (mark, body(args)) {
            (Some(Mark::CoroutineTest) | None, Returned::Coroutine(future)) => {
                let task = spawn(reactor, future);
                Ok(match clock {
                    Some(clock) => step_clock(reactor, clock, task),
                    None => task,
                })
            }
            (Some(Mark::InlineCallbackTest | Mark::PlainDeferred) | None, Returned::Deferred(deferred)) => {
                Ok(deferred)
            }
            (None, Returned::Ready(result)) => result.map(Deferred::succeeded),
            (Some(mark), _) => Err(Error::MarkMismatch { name, mark }),
        })
    }
}

/// Runs `future` on the loop as a coroutine test, under clock stepping when
/// `clock` is given.
///
/// This is what `#[reactor_bridge::test]` expands to.
///
/// # Errors
///
/// Returns the future's error, [`Error::ReactorIdle`] if clock stepping
/// stalls, or the errors of [`Bridge::block_on`].
pub fn run_coroutine<F, T>(bridge: &Bridge, clock: Option<Arc<dyn VirtualClock>>, future: F) -> Result<T>
where
    F: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    bridge.call(move |reactor| {
        let task = spawn(reactor, future);
        Ok(match clock {
            Some(clock) => step_clock(reactor, clock, task),
            None => task,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::fixture::FixtureBuilder;
    use crate::reactor::{EventLoop, ReactorKind};
    use crate::task::InlineStep;
    use std::time::Duration;

    fn bridge() -> Bridge {
        Bridge::new(Arc::new(EventLoop::new(ReactorKind::Default)))
    }

    fn value<T: Any + Copy>(value: Value) -> T {
        *value.downcast::<T>().unwrap()
    }

    #[test]
    fn test_constructors_mark() {
        let c = TestFn::coroutine("c", Vec::<String>::new(), |_| async { Ok(()) });
        assert_eq!(c.get_mark(), Some(Mark::CoroutineTest));
        let d = TestFn::deferred("d", Vec::<String>::new(), |_| Deferred::succeeded(()));
        assert_eq!(d.get_mark(), None);
        let p = TestFn::plain_deferred("p", Vec::<String>::new(), |_| Deferred::succeeded(()));
        assert_eq!(p.get_mark(), Some(Mark::PlainDeferred));
        let i = TestFn::inline_callbacks("i", ["x"], |_| {
            |_: Option<Result<Value>>| -> Result<InlineStep<()>> { Ok(InlineStep::Return(())) }
        });
        assert_eq!(i.get_mark(), Some(Mark::InlineCallbackTest));
        assert_eq!(i.params(), ["x".to_string()]);
    }

    #[test]
    fn test_each_mark_returns_value() {
        let bridge = bridge();
        let funcargs = Funcargs::new();
        let tests = [
            TestFn::coroutine("c", Vec::<String>::new(), |_| async { Ok(1_u8) }),
            TestFn::deferred("d", Vec::<String>::new(), |_| Deferred::succeeded(1_u8)),
            TestFn::plain_deferred("p", Vec::<String>::new(), |_| Deferred::succeeded(1_u8)),
            TestFn::sync("s", Vec::<String>::new(), |_| Ok(1_u8)),
            TestFn::inline_callbacks("i", Vec::<String>::new(), |args| {
                let reactor = Arc::clone(args.reactor());
                move |sent: Option<Result<Value>>| -> Result<InlineStep<u8>> {
                    match sent {
                        None => Ok(InlineStep::Yield(spawn(&reactor, async { Ok(erase(1_u8)) }))),
                        Some(value) => Ok(InlineStep::Return(*value?.downcast::<u8>().unwrap())),
                    }
                }
            }),
        ];
        for test in &tests {
            let result = TestInvoker::call(&bridge, test, &funcargs).unwrap();
            assert_eq!(value::<u8>(result), 1, "{}", test.name());
        }
    }

    #[test]
    fn test_each_mark_returns_error() {
        let bridge = bridge();
        let funcargs = Funcargs::new();
        let tests = [
            TestFn::coroutine("c", Vec::<String>::new(), |_| async {
                Err::<(), _>(Error::body("failed"))
            }),
            TestFn::deferred("d", Vec::<String>::new(), |_| {
                Deferred::<()>::failed(Error::body("failed"))
            }),
            TestFn::inline_callbacks("i", Vec::<String>::new(), |_| {
                |_: Option<Result<Value>>| -> Result<InlineStep<()>> { Err(Error::body("failed")) }
            }),
        ];
        for test in &tests {
            let err = TestInvoker::call(&bridge, test, &funcargs).unwrap_err();
            assert_eq!(err.to_string(), "failed", "{}", test.name());
        }
    }

    #[test]
    fn test_only_declared_arguments_are_passed() {
        let bridge = bridge();
        let mut funcargs = Funcargs::new();
        funcargs.insert("a", FixtureValue::new(1_i32));
        funcargs.insert("b", FixtureValue::new(2_i32));
        let test = TestFn::sync("t", ["b"], |args| Ok(args.names().map(String::from).collect::<Vec<_>>()));
        let result = TestInvoker::call(&bridge, &test, &funcargs).unwrap();
        assert_eq!(*result.downcast::<Vec<String>>().unwrap(), vec!["b".to_string()]);

        let missing = TestFn::sync("t", ["c"], |_| Ok(()));
        assert!(matches!(
            TestInvoker::call(&bridge, &missing, &funcargs),
            Err(Error::MissingArgument(name)) if name == "c"
        ));
    }

    #[test]
    fn test_mark_mismatch() {
        let bridge = bridge();
        let test = TestFn::sync("t", Vec::<String>::new(), |_| Ok(()))
            .mark(Mark::CoroutineTest)
            .unwrap();
        assert!(matches!(
            TestInvoker::call(&bridge, &test, &Funcargs::new()),
            Err(Error::MarkMismatch { mark: Mark::CoroutineTest, .. })
        ));
    }

    #[test]
    fn test_fixture_mark_on_test_is_unrecognized() {
        let bridge = bridge();
        let test = TestFn::sync("t", Vec::<String>::new(), |_| Ok(()))
            .mark(Mark::AsyncFixture)
            .unwrap();
        assert!(matches!(
            TestInvoker::call(&bridge, &test, &Funcargs::new()),
            Err(Error::UnrecognizedMark { mark: Mark::AsyncFixture, .. })
        ));
    }

    #[test]
    fn test_remark_conflict() {
        let test = TestFn::coroutine("c", Vec::<String>::new(), |_| async { Ok(()) });
        assert!(matches!(
            test.mark(Mark::PlainDeferred),
            Err(Error::MarkConflict { existing: Mark::CoroutineTest, .. })
        ));
    }

    #[test]
    #[should_panic(expected = "assertion in test body")]
    fn test_panic_reaches_caller() {
        let bridge = bridge();
        let test = TestFn::coroutine("c", Vec::<String>::new(), |_| async {
            let connected = false;
            assert!(connected, "assertion in test body");
            Ok(())
        });
        let _ = TestInvoker::call(&bridge, &test, &Funcargs::new());
    }

    #[test]
    fn test_clock_from_flagged_fixture() {
        let clock = MockClock::new();
        let provided = clock.clone();
        let def = FixtureBuilder::new("clock")
            .auto_clock(move |_| {
                let clock = provided.clone();
                async move { Ok(clock) }
            })
            .unwrap();
        let shared: Arc<dyn VirtualClock> = Arc::new(clock.clone());
        let value = FixtureValue::new(clock.clone()).with_clock(shared);

        let mut funcargs = Funcargs::new();
        funcargs.insert_fixture(&def, value);
        assert!(funcargs.clock().is_none());
        def.set_has_clock();
        assert!(funcargs.clock().is_some());
    }

    #[test]
    fn test_run_coroutine_with_clock() {
        let bridge = bridge();
        let clock = MockClock::new();
        let sleeper = clock.clone();
        let now = run_coroutine(&bridge, Some(Arc::new(clock.clone())), async move {
            sleeper.sleep(Duration::from_secs(30)).await;
            Ok(sleeper.now())
        })
        .unwrap();
        assert_eq!(now, Duration::from_secs(30));
    }
}
