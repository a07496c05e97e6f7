//! Fixture definitions and the async fixture orchestrator.
//!
//! A [`FixtureDef`] is built with a [`FixtureBuilder`]. Synchronous fixtures
//! are left to the harness; the builder's async constructors tag the
//! definition with a [`Mark`] and restrict its scope, and the
//! [`FixtureOrchestrator`] runs marked fixtures inside the loop.
//!
//! # Example
//!
//! ```rust
//! use reactor_bridge::fixture::{FixtureBuilder, Scope};
//! use reactor_bridge::mark::Mark;
//!
//! let answer = FixtureBuilder::new("answer")
//!     .async_fn(|_args| async { Ok(42_u32) })
//!     .unwrap();
//! assert_eq!(answer.mark(), Some(Mark::AsyncFixture));
//!
//! let rejected = FixtureBuilder::new("pool")
//!     .scope(Scope::Session)
//!     .async_fn(|_args| async { Ok(()) });
//! assert!(rejected.is_err());
//! ```

mod orchestrator;

use std::any::{self, Any};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_core::Stream;
use pin_project::pin_project;

pub use orchestrator::{CachedResult, FixtureOrchestrator, InstanceKey};

use crate::clock::VirtualClock;
use crate::error::{Error, Result};
use crate::mark::{self, CallableId, Mark};
use crate::reactor::Reactor;

/// Boxed future returned by async fixture bodies.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'static>>;

/// Boxed stream returned by async generator fixture bodies.
pub type BoxStream = Pin<Box<dyn Stream<Item = Result<FixtureValue>> + Send + 'static>>;

/// How long a fixture instance is cached by the harness.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scope {
    /// One instance per test.
    Function,
    /// One instance per test class.
    Class,
    /// One instance per module.
    Module,
    /// One instance per package.
    Package,
    /// One instance per run.
    Session,
}

impl Scope {
    /// Returns the harness name of the scope.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Scope::Function => "function",
            Scope::Class => "class",
            Scope::Module => "module",
            Scope::Package => "package",
            Scope::Session => "session",
        }
    }

    /// Returns true for the scopes async fixtures may use.
    #[must_use]
    pub fn is_async_supported(self) -> bool {
        matches!(self, Scope::Function | Scope::Module)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Scope {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "function" => Ok(Scope::Function),
            "class" => Ok(Scope::Class),
            "module" => Ok(Scope::Module),
            "package" => Ok(Scope::Package),
            "session" => Ok(Scope::Session),
            _ => Err(Error::UnknownScope(s.to_string())),
        }
    }
}

/// A shareable, type-erased fixture value.
#[derive(Clone)]
pub struct FixtureValue {
    value: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
    clock: Option<Arc<dyn VirtualClock>>,
}

impl FixtureValue {
    /// Wraps `value`.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            value: Arc::new(value),
            type_name: any::type_name::<T>(),
            clock: None,
        }
    }

    pub(crate) fn with_clock(mut self, clock: Arc<dyn VirtualClock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Returns the value if it is a `T`.
    #[must_use]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref()
    }

    /// Returns the clock provided by an auto-clock fixture.
    #[must_use]
    pub fn clock(&self) -> Option<&Arc<dyn VirtualClock>> {
        self.clock.as_ref()
    }
}

impl fmt::Debug for FixtureValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixtureValue")
            .field("type", &self.type_name)
            .field("has_clock", &self.clock.is_some())
            .finish()
    }
}

/// Arguments passed to a test or fixture body: the values of its declared
/// parameters, and the reactor it runs on.
#[derive(Clone)]
pub struct Args {
    reactor: Arc<dyn Reactor>,
    values: Vec<(String, FixtureValue)>,
}

impl Args {
    /// Creates the argument set.
    #[must_use]
    pub fn new(reactor: Arc<dyn Reactor>, values: Vec<(String, FixtureValue)>) -> Self {
        Self { reactor, values }
    }

    /// Returns the reactor the body runs on.
    #[must_use]
    pub fn reactor(&self) -> &Arc<dyn Reactor> {
        &self.reactor
    }

    /// Returns the names of the arguments, in declaration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.iter().map(|(name, _)| name.as_str())
    }

    /// Returns the raw value of argument `name`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingArgument`] if there is no such argument.
    pub fn value(&self, name: &str) -> Result<&FixtureValue> {
        self.values
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, value)| value)
            .ok_or_else(|| Error::MissingArgument(name.to_string()))
    }

    /// Returns a clone of argument `name` as a `T`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingArgument`] if there is no such argument, or
    /// [`Error::ArgumentType`] if it is not a `T`.
    pub fn get<T: Any + Clone>(&self, name: &str) -> Result<T> {
        self.value(name)?
            .downcast_ref::<T>()
            .cloned()
            .ok_or_else(|| Error::ArgumentType {
                name: name.to_string(),
                expected: any::type_name::<T>(),
            })
    }
}

impl fmt::Debug for Args {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.values.iter().map(|(name, value)| (name, value)))
            .finish()
    }
}

type SyncBody = Arc<dyn Fn(&Args) -> Result<FixtureValue> + Send + Sync>;
type AsyncBody = Arc<dyn Fn(Args) -> BoxFuture<FixtureValue> + Send + Sync>;
type GeneratorBody = Arc<dyn Fn(Args) -> BoxStream + Send + Sync>;

#[derive(Clone)]
pub(crate) enum FixtureBody {
    /// Run by the harness itself.
    Sync(SyncBody),
    Async(AsyncBody),
    Generator(GeneratorBody),
}

/// A fixture definition.
pub struct FixtureDef {
    id: CallableId,
    name: String,
    scope: Scope,
    params: Vec<String>,
    autouse: bool,
    body: FixtureBody,
    has_clock: AtomicBool,
}

impl FixtureDef {
    /// Returns the identity the fixture's mark is keyed by.
    #[must_use]
    pub fn id(&self) -> CallableId {
        self.id
    }

    /// Returns the fixture name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the fixture scope.
    #[must_use]
    pub fn scope(&self) -> Scope {
        self.scope
    }

    /// Returns the names of the fixtures this one depends on.
    #[must_use]
    pub fn params(&self) -> &[String] {
        &self.params
    }

    /// Returns true if the harness instantiates this fixture for every test.
    #[must_use]
    pub fn autouse(&self) -> bool {
        self.autouse
    }

    /// Returns the fixture's mark, or `None` for synchronous fixtures.
    #[must_use]
    pub fn mark(&self) -> Option<Mark> {
        mark::get_mark(self.id)
    }

    /// Returns true once an instance of this auto-clock fixture was set up.
    #[must_use]
    pub fn has_clock(&self) -> bool {
        self.has_clock.load(Ordering::Acquire)
    }

    pub(crate) fn set_has_clock(&self) {
        self.has_clock.store(true, Ordering::Release);
    }

    pub(crate) fn body(&self) -> &FixtureBody {
        &self.body
    }

    /// Runs a synchronous fixture body.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnrecognizedMark`] for marked fixtures, which must go
    /// through the [`FixtureOrchestrator`], or the body's error.
    pub fn call_sync(&self, args: &Args) -> Result<FixtureValue> {
        match (&self.body, self.mark()) {
            (FixtureBody::Sync(body), None) => body(args),
            (_, Some(mark)) => Err(Error::UnrecognizedMark {
                name: self.name.clone(),
                mark,
            }),
            (_, None) => Err(Error::UnknownFixture(self.name.clone())),
        }
    }
}

impl fmt::Debug for FixtureDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixtureDef")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("scope", &self.scope)
            .field("params", &self.params)
            .field("autouse", &self.autouse)
            .field("mark", &self.mark())
            .finish_non_exhaustive()
    }
}

/// Builds [`FixtureDef`]s.
#[derive(Debug, Clone)]
pub struct FixtureBuilder {
    name: String,
    scope: Scope,
    params: Vec<String>,
    autouse: bool,
}

impl FixtureBuilder {
    /// Starts a function-scoped fixture named `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scope: Scope::Function,
            params: Vec::new(),
            autouse: false,
        }
    }

    /// Sets the scope.
    #[must_use]
    pub fn scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    /// Declares the fixtures this one depends on.
    #[must_use]
    pub fn params<I, S>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.params = params.into_iter().map(Into::into).collect();
        self
    }

    /// Instantiates the fixture for every test, named or not.
    #[must_use]
    pub fn autouse(mut self, autouse: bool) -> Self {
        self.autouse = autouse;
        self
    }

    /// Builds an unmarked fixture run synchronously by the harness.
    pub fn sync<F, T>(self, body: F) -> Arc<FixtureDef>
    where
        F: Fn(&Args) -> Result<T> + Send + Sync + 'static,
        T: Any + Send + Sync,
    {
        let body: SyncBody = Arc::new(move |args: &Args| body(args).map(FixtureValue::new));
        Arc::new(self.build(FixtureBody::Sync(body)))
    }

    /// Builds a fixture whose body is a future, awaited once at setup.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedScope`] unless the scope is function or
    /// module.
    pub fn async_fn<F, Fut, T>(self, body: F) -> Result<Arc<FixtureDef>>
    where
        F: Fn(Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Any + Send + Sync,
    {
        let body: AsyncBody = Arc::new(move |args: Args| -> BoxFuture<FixtureValue> {
            let future = body(args);
            Box::pin(async move { future.await.map(FixtureValue::new) })
        });
        self.build_marked(FixtureBody::Async(body), Mark::AsyncFixture)
    }

    /// Builds a fixture whose body is a stream: the first item is the
    /// fixture value, and the stream must end on the next poll, which runs
    /// the teardown.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedScope`] unless the scope is function or
    /// module.
    pub fn async_generator<F, S, T>(self, body: F) -> Result<Arc<FixtureDef>>
    where
        F: Fn(Args) -> S + Send + Sync + 'static,
        S: Stream<Item = Result<T>> + Send + 'static,
        T: Any + Send + Sync,
    {
        let body: GeneratorBody = Arc::new(move |args: Args| -> BoxStream {
            Box::pin(IntoValues { inner: body(args) })
        });
        self.build_marked(FixtureBody::Generator(body), Mark::AsyncGeneratorFixture)
    }

    /// Builds an async fixture providing a virtual clock. Tests depending on
    /// it run under clock stepping.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedScope`] unless the scope is function or
    /// module.
    pub fn auto_clock<F, Fut, C>(self, body: F) -> Result<Arc<FixtureDef>>
    where
        F: Fn(Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<C>> + Send + 'static,
        C: VirtualClock + Clone,
    {
        let body: AsyncBody = Arc::new(move |args: Args| -> BoxFuture<FixtureValue> {
            let future = body(args);
            Box::pin(async move {
                let clock = future.await?;
                let shared: Arc<dyn VirtualClock> = Arc::new(clock.clone());
                Ok(FixtureValue::new(clock).with_clock(shared))
            })
        });
        self.build_marked(FixtureBody::Async(body), Mark::AutoClockFixture)
    }

    fn build_marked(self, body: FixtureBody, mark: Mark) -> Result<Arc<FixtureDef>> {
        if !self.scope.is_async_supported() {
            return Err(Error::UnsupportedScope(self.scope));
        }
        let def = self.build(body);
        mark::set_mark(def.id, &def.name, mark)?;
        Ok(Arc::new(def))
    }

    fn build(self, body: FixtureBody) -> FixtureDef {
        FixtureDef {
            id: CallableId::new(),
            name: self.name,
            scope: self.scope,
            params: self.params,
            autouse: self.autouse,
            body,
            has_clock: AtomicBool::new(false),
        }
    }
}

/// Wraps each yielded item of a generator fixture.
#[pin_project]
struct IntoValues<S> {
    #[pin]
    inner: S,
}

impl<S, T> Stream for IntoValues<S>
where
    S: Stream<Item = Result<T>>,
    T: Any + Send + Sync,
{
    type Item = Result<FixtureValue>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.project()
            .inner
            .poll_next(cx)
            .map(|item| item.map(|result| result.map(FixtureValue::new)))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}
