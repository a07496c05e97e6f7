//! The harness side of the bridge.
//!
//! [`FixtureRequest`] is what the [`FixtureOrchestrator`] needs from a test
//! harness while setting up one fixture. [`Session`] is a small harness
//! built on it: fixtures are registered by name, resolved recursively for
//! each test, cached per scope and torn down when their scope ends.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use reactor_bridge::bridge::Bridge;
//! use reactor_bridge::fixture::FixtureBuilder;
//! use reactor_bridge::harness::Session;
//! use reactor_bridge::invoke::TestFn;
//! use reactor_bridge::reactor::{EventLoop, ReactorKind};
//!
//! let bridge = Arc::new(Bridge::new(Arc::new(EventLoop::new(ReactorKind::Default))));
//! let session = Session::new(Arc::clone(&bridge));
//! session.register(FixtureBuilder::new("answer").async_fn(|_| async { Ok(42_u32) }).unwrap());
//!
//! let test = TestFn::coroutine("test_answer", ["answer"], |args| async move {
//!     Ok(args.get::<u32>("answer")?)
//! });
//! let value = session.run_test(&test).unwrap();
//! assert_eq!(*value.downcast::<u32>().unwrap(), 42);
//! session.finish().unwrap();
//! ```

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::bridge::Bridge;
use crate::error::{Error, Result};
use crate::fixture::{Args, FixtureBuilder, FixtureDef, FixtureOrchestrator, FixtureValue, Scope};
use crate::invoke::{Funcargs, TestFn, TestInvoker};
use crate::reactor::Reactor;
use crate::task::Value;

/// Name of the built-in fixture providing the session's reactor.
pub const REACTOR_FIXTURE: &str = "reactor";

/// The harness services available while one fixture is set up.
pub trait FixtureRequest {
    /// Name of the fixture being set up.
    fn fixture_name(&self) -> &str;

    /// Index distinguishing this instantiation from others of the same
    /// fixture.
    fn param_index(&self) -> usize;

    /// Returns the value of the fixture `name`, setting it up if needed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownFixture`] or the error of setting it up.
    fn resolve(&self, name: &str) -> Result<FixtureValue>;
}

/// A fixture instance awaiting finalization.
struct Finalizer {
    def: Arc<FixtureDef>,
    param_index: usize,
}

/// Fixture state of the test being run.
#[derive(Default)]
struct TestState {
    cache: Mutex<HashMap<String, FixtureValue>>,
    /// Every fixture the test depends on, directly or not, in set-up order.
    used: Mutex<Vec<(Arc<FixtureDef>, FixtureValue)>>,
    finalizers: Mutex<Vec<Finalizer>>,
}

impl TestState {
    fn record(&self, def: &Arc<FixtureDef>, value: &FixtureValue) {
        let mut used = self.used.lock();
        if !used.iter().any(|(known, _)| known.id() == def.id()) {
            used.push((Arc::clone(def), value.clone()));
        }
    }
}

struct Request<'a> {
    session: &'a Session,
    test: &'a TestState,
    name: &'a str,
    param_index: usize,
}

impl FixtureRequest for Request<'_> {
    fn fixture_name(&self) -> &str {
        self.name
    }

    fn param_index(&self) -> usize {
        self.param_index
    }

    fn resolve(&self, name: &str) -> Result<FixtureValue> {
        self.session.resolve(name, self.test)
    }
}

/// A minimal test harness driving the bridge.
///
/// Function-scoped fixtures live for one test; wider scopes are shared until
/// [`finish_module`](Session::finish_module) (module and class scope) or
/// [`finish`](Session::finish) (package and session scope).
pub struct Session {
    bridge: Arc<Bridge>,
    orchestrator: FixtureOrchestrator,
    fixtures: Mutex<Vec<Arc<FixtureDef>>>,
    shared: Mutex<HashMap<String, FixtureValue>>,
    module_finalizers: Mutex<Vec<Finalizer>>,
    instances: Mutex<HashMap<String, usize>>,
}

impl Session {
    /// Creates a session running its tests through `bridge`.
    ///
    /// The session provides a built-in session-scoped fixture named
    /// [`REACTOR_FIXTURE`] holding the bridge's reactor.
    #[must_use]
    pub fn new(bridge: Arc<Bridge>) -> Self {
        let reactor = Arc::clone(bridge.reactor());
        let builtin = FixtureBuilder::new(REACTOR_FIXTURE)
            .scope(Scope::Session)
            .sync(move |_| Ok(Arc::clone(&reactor)));
        Self {
            bridge,
            orchestrator: FixtureOrchestrator::new(),
            fixtures: Mutex::new(vec![builtin]),
            shared: Mutex::new(HashMap::new()),
            module_finalizers: Mutex::new(Vec::new()),
            instances: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the bridge tests run through.
    #[must_use]
    pub fn bridge(&self) -> &Arc<Bridge> {
        &self.bridge
    }

    /// Returns the reactor of the bridge.
    #[must_use]
    pub fn reactor(&self) -> &Arc<dyn Reactor> {
        self.bridge.reactor()
    }

    /// Returns the fixture orchestrator of the session.
    #[must_use]
    pub fn orchestrator(&self) -> &FixtureOrchestrator {
        &self.orchestrator
    }

    /// Registers a fixture. A later fixture with the same name overrides an
    /// earlier one.
    pub fn register(&self, def: Arc<FixtureDef>) {
        tracing::trace!(fixture = def.name(), scope = %def.scope(), "fixture registered");
        self.fixtures.lock().push(def);
    }

    fn lookup(&self, name: &str) -> Result<Arc<FixtureDef>> {
        self.fixtures
            .lock()
            .iter()
            .rev()
            .find(|def| def.name() == name)
            .cloned()
            .ok_or_else(|| Error::UnknownFixture(name.to_string()))
    }

    fn cached(&self, def: &FixtureDef, test: &TestState) -> Option<FixtureValue> {
        match def.scope() {
            Scope::Function => test.cache.lock().get(def.name()).cloned(),
            _ => self.shared.lock().get(def.name()).cloned(),
        }
    }

    fn next_index(&self, name: &str) -> usize {
        let mut instances = self.instances.lock();
        let index = instances.entry(name.to_string()).or_insert(0);
        let current = *index;
        *index += 1;
        current
    }

    fn resolve(&self, name: &str, test: &TestState) -> Result<FixtureValue> {
        let def = self.lookup(name)?;
        if let Some(value) = self.cached(&def, test) {
            test.record(&def, &value);
            return Ok(value);
        }

        let param_index = self.next_index(name);
        let request = Request {
            session: self,
            test,
            name,
            param_index,
        };
        let value = match self.orchestrator.setup(&self.bridge, &def, &request)? {
            Some(cached) => cached.into_value(),
            None => {
                let values = def
                    .params()
                    .iter()
                    .map(|param| Ok((param.clone(), self.resolve(param, test)?)))
                    .collect::<Result<Vec<_>>>()?;
                def.call_sync(&Args::new(Arc::clone(self.reactor()), values))?
            }
        };

        let finalizer = Finalizer {
            def: Arc::clone(&def),
            param_index,
        };
        match def.scope() {
            Scope::Function => {
                test.cache.lock().insert(name.to_string(), value.clone());
                test.finalizers.lock().push(finalizer);
            }
            _ => {
                self.shared.lock().insert(name.to_string(), value.clone());
                self.module_finalizers.lock().push(finalizer);
            }
        }
        test.record(&def, &value);
        Ok(value)
    }

    /// Sets up the test's fixtures, runs it, and tears down its
    /// function-scoped fixtures.
    ///
    /// Autouse fixtures are set up for every test but only passed to tests
    /// that name them.
    ///
    /// # Errors
    ///
    /// Returns the first fixture setup error, the test's error, or the
    /// teardown error. A test error takes precedence over a teardown error,
    /// which is then only logged.
    ///
    /// # Panics
    ///
    /// A panicking test resumes its panic after teardown.
    pub fn run_test(&self, test: &TestFn) -> Result<Value> {
        tracing::debug!(test = test.name(), "running test");
        let state = TestState::default();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.setup_and_call(test, &state)));
        let teardown = self.teardown(&state.finalizers);

        let outcome = match outcome {
            Ok(result) => result,
            Err(payload) => {
                if let Err(error) = teardown {
                    tracing::warn!(test = test.name(), %error, "teardown failed after test panic");
                }
                panic::resume_unwind(payload);
            }
        };
        match (outcome, teardown) {
            (Err(error), Err(teardown_error)) => {
                tracing::warn!(test = test.name(), error = %teardown_error, "teardown failed after test failure");
                Err(error)
            }
            (Ok(_), Err(teardown_error)) => Err(teardown_error),
            (outcome, Ok(())) => outcome,
        }
    }

    fn setup_and_call(&self, test: &TestFn, state: &TestState) -> Result<Value> {
        let autouse: Vec<String> = self
            .fixtures
            .lock()
            .iter()
            .filter(|def| def.autouse())
            .map(|def| def.name().to_string())
            .collect();
        for name in autouse.iter().map(String::as_str).chain(test.params().iter().map(String::as_str)) {
            self.resolve(name, state)?;
        }

        let mut funcargs = Funcargs::new();
        for (def, value) in state.used.lock().iter() {
            funcargs.insert_fixture(def, value.clone());
        }
        TestInvoker::call(&self.bridge, test, &funcargs)
    }

    /// Finalizes fixtures in reverse set-up order, then drains the queued
    /// generator teardown.
    fn teardown(&self, finalizers: &Mutex<Vec<Finalizer>>) -> Result<()> {
        let finalizers = std::mem::take(&mut *finalizers.lock());
        for finalizer in finalizers.into_iter().rev() {
            let request = FinalizeRequest {
                name: finalizer.def.name(),
                param_index: finalizer.param_index,
            };
            self.orchestrator.finalize(&self.bridge, &request);
        }
        self.orchestrator.drain(&self.bridge)
    }

    /// Tears down module- and class-scoped fixtures.
    ///
    /// # Errors
    ///
    /// Returns the first [`Error::AsyncFixtureDidNotStop`].
    pub fn finish_module(&self) -> Result<()> {
        let (ending, keeping): (Vec<_>, Vec<_>) = std::mem::take(&mut *self.module_finalizers.lock())
            .into_iter()
            .partition(|finalizer| matches!(finalizer.def.scope(), Scope::Module | Scope::Class));
        *self.module_finalizers.lock() = keeping;
        self.shared
            .lock()
            .retain(|name, _| !ending.iter().any(|finalizer| finalizer.def.name() == name));
        self.teardown(&Mutex::new(ending))
    }

    /// Tears down every remaining fixture and checks that no generator
    /// teardown was skipped.
    ///
    /// # Errors
    ///
    /// Returns the first [`Error::AsyncFixtureDidNotStop`], or
    /// [`Error::TeardownSkipped`].
    pub fn finish(&self) -> Result<()> {
        let module = self.finish_module();
        self.shared.lock().clear();
        let rest = self.teardown(&self.module_finalizers);
        module.and(rest)?;
        self.orchestrator.ensure_drained()?;
        tracing::debug!("session finished");
        Ok(())
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("bridge", &self.bridge)
            .field("fixtures", &self.fixtures.lock().len())
            .field("orchestrator", &self.orchestrator)
            .finish_non_exhaustive()
    }
}

/// Finalization only needs the instantiation's identity.
struct FinalizeRequest<'a> {
    name: &'a str,
    param_index: usize,
}

impl FixtureRequest for FinalizeRequest<'_> {
    fn fixture_name(&self) -> &str {
        self.name
    }

    fn param_index(&self) -> usize {
        self.param_index
    }

    fn resolve(&self, name: &str) -> Result<FixtureValue> {
        Err(Error::UnknownFixture(name.to_string()))
    }
}
