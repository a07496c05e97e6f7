//! Setup and teardown of marked fixtures.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future;
use std::sync::Arc;

use futures_core::Stream;
use parking_lot::Mutex;

use super::{Args, BoxStream, FixtureBody, FixtureDef, FixtureValue};
use crate::bridge::Bridge;
use crate::error::{Error, Result};
use crate::harness::FixtureRequest;
use crate::mark::Mark;
use crate::task::{spawn, Deferred, Outcome};

/// Identity of one fixture instantiation.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct InstanceKey {
    /// Name of the fixture.
    pub fixture: String,
    /// The harness's per-instantiation parameter index.
    pub param_index: usize,
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.fixture, self.param_index)
    }
}

/// The cached result reported to the harness for a fixture the
/// orchestrator handled.
#[derive(Clone, Debug)]
pub struct CachedResult {
    value: FixtureValue,
    param_index: usize,
}

impl CachedResult {
    /// The fixture value.
    #[must_use]
    pub fn value(&self) -> &FixtureValue {
        &self.value
    }

    /// The instantiation's parameter index.
    #[must_use]
    pub fn param_index(&self) -> usize {
        self.param_index
    }

    /// The setup error; always `None`, since failed setups are returned as
    /// errors instead of cached.
    #[must_use]
    pub fn error(&self) -> Option<&Error> {
        None
    }

    /// Consumes the result, returning the value.
    #[must_use]
    pub fn into_value(self) -> FixtureValue {
        self.value
    }
}

/// A final generator step that was scheduled but not yet awaited. The step
/// settles with the generator's own outcome, so waiting on it only fails for
/// reasons of the bridge.
type QueuedTeardown = (InstanceKey, Deferred<Outcome<Option<FixtureValue>>>);

/// Runs marked fixtures inside the loop and defers generator teardown.
///
/// One orchestrator serves a whole harness session. It holds the
/// generators of async generator fixtures between setup and finalization,
/// and the queue of final steps scheduled by finalization, which the
/// harness drains at the end of every test's teardown.
#[derive(Default)]
pub struct FixtureOrchestrator {
    pending: Mutex<HashMap<InstanceKey, BoxStream>>,
    queue: Mutex<VecDeque<QueuedTeardown>>,
}

impl FixtureOrchestrator {
    /// Creates an orchestrator with no pending teardown.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets up `def` if it is marked.
    ///
    /// Returns `Ok(None)` for unmarked fixtures, which the harness sets up on
    /// its own. Otherwise resolves the fixture's arguments through
    /// `request`, runs its body inside the loop and returns the result to
    /// cache.
    ///
    /// # Errors
    ///
    /// Returns argument resolution errors, the body's error,
    /// [`Error::AsyncFixtureDidNotYield`] for a generator that ends without
    /// yielding, or [`Error::UnrecognizedMark`] for a test mark.
    pub fn setup(
        &self,
        bridge: &Bridge,
        def: &Arc<FixtureDef>,
        request: &dyn FixtureRequest,
    ) -> Result<Option<CachedResult>> {
        let Some(mark) = def.mark() else {
            return Ok(None);
        };
        let key = InstanceKey {
            fixture: request.fixture_name().to_string(),
            param_index: request.param_index(),
        };
        tracing::debug!(fixture = %key, %mark, "setting up async fixture");

        let values = def
            .params()
            .iter()
            .map(|name| Ok((name.clone(), request.resolve(name)?)))
            .collect::<Result<Vec<_>>>()?;
        let args = Args::new(Arc::clone(bridge.reactor()), values);

        let value = match (mark, def.body()) {
            (Mark::AsyncFixture | Mark::AutoClockFixture, FixtureBody::Async(body)) => {
                let value = bridge.run(body(args))?;
                if mark == Mark::AutoClockFixture {
                    def.set_has_clock();
                }
                value
            }
            (Mark::AsyncGeneratorFixture, FixtureBody::Generator(body)) => {
                let mut stream = body(args);
                let (first, stream) = bridge.run(async move {
                    let first = next(&mut stream).await;
                    Ok((first, stream))
                })?;
                match first {
                    Some(Ok(value)) => {
                        self.pending.lock().insert(key.clone(), stream);
                        value
                    }
                    Some(Err(error)) => return Err(error),
                    None => return Err(Error::AsyncFixtureDidNotYield(def.name().to_string())),
                }
            }
            (mark, _) => {
                return Err(Error::UnrecognizedMark {
                    name: def.name().to_string(),
                    mark,
                })
            }
        };

        tracing::trace!(fixture = %key, ?value, "async fixture ready");
        Ok(Some(CachedResult {
            value,
            param_index: key.param_index,
        }))
    }

    /// Schedules the final step of the instantiation's generator, if any.
    ///
    /// The step is not awaited here; it runs when the queue is
    /// [`drain`](FixtureOrchestrator::drain)ed.
    pub fn finalize(&self, bridge: &Bridge, request: &dyn FixtureRequest) {
        let key = InstanceKey {
            fixture: request.fixture_name().to_string(),
            param_index: request.param_index(),
        };
        let Some(mut stream) = self.pending.lock().remove(&key) else {
            return;
        };
        let step = spawn(bridge.reactor(), async move { next(&mut stream).await.transpose() });
        let settled = Deferred::new();
        let target = settled.clone();
        step.add_callback(move |outcome| {
            let _ = target.succeed(outcome);
        });
        tracing::debug!(fixture = %key, "async fixture teardown queued");
        self.queue.lock().push_back((key, settled));
    }

    /// Awaits every queued teardown step, oldest first.
    ///
    /// Each step must find its generator exhausted. The whole queue is
    /// drained even after a violation.
    ///
    /// # Errors
    ///
    /// Returns the first [`Error::AsyncFixtureDidNotStop`]: a generator
    /// that yielded again, failed, or panicked. [`Error::LoopStopped`] and
    /// [`Error::LoopNotRunning`] are returned as they are, leaving the rest
    /// of the queue in place.
    pub fn drain(&self, bridge: &Bridge) -> Result<()> {
        let mut first_violation = None;
        loop {
            let Some((key, step)) = self.queue.lock().pop_front() else {
                break;
            };
            let reason = match bridge.block_on(step) {
                Ok(Ok(None)) => {
                    tracing::trace!(fixture = %key, "async fixture stopped");
                    continue;
                }
                Ok(Ok(Some(_))) => "yielded another value".to_string(),
                Ok(Err(failure)) => failure.to_string(),
                Err(error) => {
                    tracing::warn!(fixture = %key, %error, "async fixture teardown interrupted");
                    return Err(error);
                }
            };
            tracing::warn!(fixture = %key, %reason, "async fixture did not stop");
            if first_violation.is_none() {
                first_violation = Some(Error::did_not_stop(key.fixture, reason));
            }
        }
        first_violation.map_or(Ok(()), Err)
    }

    /// Checks that no generator teardown was skipped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TeardownSkipped`] if a generator was never finalized
    /// or a queued step was never drained.
    pub fn ensure_drained(&self) -> Result<()> {
        let pending = self.pending_count();
        let queued = self.queued_count();
        if pending == 0 && queued == 0 {
            Ok(())
        } else {
            Err(Error::TeardownSkipped { pending, queued })
        }
    }

    /// Number of generators waiting for finalization.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Number of scheduled teardown steps waiting to be drained.
    #[must_use]
    pub fn queued_count(&self) -> usize {
        self.queue.lock().len()
    }
}

impl fmt::Debug for FixtureOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixtureOrchestrator")
            .field("pending", &self.pending_count())
            .field("queued", &self.queued_count())
            .finish()
    }
}

async fn next(stream: &mut BoxStream) -> Option<Result<FixtureValue>> {
    future::poll_fn(|cx| stream.as_mut().poll_next(cx)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::fixture::{FixtureBuilder, Scope};
    use crate::reactor::{EventLoop, ReactorKind};
    use futures::stream;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Request {
        name: String,
        index: usize,
        values: Vec<(String, FixtureValue)>,
    }

    impl Request {
        fn new(def: &FixtureDef, index: usize) -> Self {
            Self {
                name: def.name().to_string(),
                index,
                values: Vec::new(),
            }
        }
    }

    impl FixtureRequest for Request {
        fn fixture_name(&self) -> &str {
            &self.name
        }

        fn param_index(&self) -> usize {
            self.index
        }

        fn resolve(&self, name: &str) -> Result<FixtureValue> {
            self.values
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v.clone())
                .ok_or_else(|| Error::UnknownFixture(name.to_string()))
        }
    }

    fn bridge() -> Bridge {
        Bridge::new(Arc::new(EventLoop::new(ReactorKind::Default)))
    }

    /// A generator fixture yielding `value`, counting teardowns in `stops`.
    fn generator(name: &str, stops: &Arc<AtomicUsize>) -> Arc<FixtureDef> {
        let stops = Arc::clone(stops);
        FixtureBuilder::new(name)
            .async_generator(move |_| {
                let stops = Arc::clone(&stops);
                stream::unfold(0_u8, move |step| {
                    let stops = Arc::clone(&stops);
                    async move {
                        match step {
                            0 => Some((Ok(7_u32), 1)),
                            _ => {
                                stops.fetch_add(1, Ordering::SeqCst);
                                None
                            }
                        }
                    }
                })
            })
            .unwrap()
    }

    #[test]
    fn test_unmarked_fixture_is_declined() {
        let bridge = bridge();
        let orchestrator = FixtureOrchestrator::new();
        let def = FixtureBuilder::new("plain").sync(|_| Ok(1_u8));
        let result = orchestrator
            .setup(&bridge, &def, &Request::new(&def, 0))
            .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_async_fixture_value_is_cached() {
        let bridge = bridge();
        let orchestrator = FixtureOrchestrator::new();
        let def = FixtureBuilder::new("answer")
            .async_fn(|_| async { Ok(42_i32) })
            .unwrap();
        let result = orchestrator
            .setup(&bridge, &def, &Request::new(&def, 3))
            .unwrap()
            .unwrap();
        assert_eq!(result.value().downcast_ref::<i32>(), Some(&42));
        assert_eq!(result.param_index(), 3);
        assert!(result.error().is_none());
        assert_eq!(orchestrator.pending_count(), 0);
    }

    #[test]
    fn test_arguments_resolved_through_request() {
        let bridge = bridge();
        let orchestrator = FixtureOrchestrator::new();
        let def = FixtureBuilder::new("sum")
            .params(["a", "b"])
            .async_fn(|args| async move { Ok(args.get::<i32>("a")? + args.get::<i32>("b")?) })
            .unwrap();
        let mut request = Request::new(&def, 0);
        request.values = vec![
            ("a".to_string(), FixtureValue::new(40_i32)),
            ("b".to_string(), FixtureValue::new(2_i32)),
        ];
        let result = orchestrator.setup(&bridge, &def, &request).unwrap().unwrap();
        assert_eq!(result.value().downcast_ref::<i32>(), Some(&42));

        request.values.clear();
        assert!(matches!(
            orchestrator.setup(&bridge, &def, &request),
            Err(Error::UnknownFixture(name)) if name == "a"
        ));
    }

    #[test]
    fn test_auto_clock_sets_has_clock() {
        let bridge = bridge();
        let orchestrator = FixtureOrchestrator::new();
        let def = FixtureBuilder::new("clock")
            .auto_clock(|_| async { Ok(MockClock::new()) })
            .unwrap();
        let result = orchestrator
            .setup(&bridge, &def, &Request::new(&def, 0))
            .unwrap()
            .unwrap();
        assert!(def.has_clock());
        assert!(result.value().clock().is_some());
        assert!(result.value().downcast_ref::<MockClock>().is_some());
    }

    #[test]
    fn test_generator_lifecycle() {
        let bridge = bridge();
        let orchestrator = FixtureOrchestrator::new();
        let stops = Arc::new(AtomicUsize::new(0));
        let def = generator("resource", &stops);

        for index in 0..3 {
            let result = orchestrator
                .setup(&bridge, &def, &Request::new(&def, index))
                .unwrap()
                .unwrap();
            assert_eq!(result.value().downcast_ref::<u32>(), Some(&7));
        }
        assert_eq!(orchestrator.pending_count(), 3);
        assert!(matches!(
            orchestrator.ensure_drained(),
            Err(Error::TeardownSkipped { pending: 3, queued: 0 })
        ));

        for index in 0..3 {
            orchestrator.finalize(&bridge, &Request::new(&def, index));
        }
        assert_eq!(orchestrator.pending_count(), 0);
        assert_eq!(orchestrator.queued_count(), 3);
        assert_eq!(stops.load(Ordering::SeqCst), 0);

        orchestrator.drain(&bridge).unwrap();
        assert_eq!(stops.load(Ordering::SeqCst), 3);
        orchestrator.ensure_drained().unwrap();
    }

    #[test]
    fn test_finalize_without_pending_is_noop() {
        let bridge = bridge();
        let orchestrator = FixtureOrchestrator::new();
        let stops = Arc::new(AtomicUsize::new(0));
        let def = generator("resource", &stops);
        orchestrator.finalize(&bridge, &Request::new(&def, 0));
        assert_eq!(orchestrator.queued_count(), 0);
    }

    #[test]
    fn test_generator_without_yield() {
        let bridge = bridge();
        let orchestrator = FixtureOrchestrator::new();
        let def = FixtureBuilder::new("empty")
            .async_generator(|_| stream::iter(Vec::<Result<u8>>::new()))
            .unwrap();
        assert!(matches!(
            orchestrator.setup(&bridge, &def, &Request::new(&def, 0)),
            Err(Error::AsyncFixtureDidNotYield(name)) if name == "empty"
        ));
        assert_eq!(orchestrator.pending_count(), 0);
    }

    #[test]
    fn test_drain_reports_first_violation_and_drains_all() {
        let bridge = bridge();
        let orchestrator = FixtureOrchestrator::new();
        let twice = FixtureBuilder::new("twice")
            .async_generator(|_| stream::iter(vec![Ok(1_u8), Ok(2_u8)]))
            .unwrap();
        let failing = FixtureBuilder::new("failing")
            .async_generator(|_| stream::iter(vec![Ok(1_u8), Err(Error::body("cleanup failed"))]))
            .unwrap();
        let stops = Arc::new(AtomicUsize::new(0));
        let good = generator("good", &stops);

        for def in [&twice, &failing, &good] {
            orchestrator
                .setup(&bridge, def, &Request::new(def, 0))
                .unwrap();
            orchestrator.finalize(&bridge, &Request::new(def, 0));
        }

        let err = orchestrator.drain(&bridge).unwrap_err();
        assert_eq!(
            err.to_string(),
            "async fixture did not stop: twice (yielded another value)"
        );
        assert_eq!(stops.load(Ordering::SeqCst), 1);
        orchestrator.ensure_drained().unwrap();
    }

    #[test]
    fn test_panicking_teardown_did_not_stop() {
        let bridge = bridge();
        let orchestrator = FixtureOrchestrator::new();
        let def = FixtureBuilder::new("fragile")
            .async_generator(|_| {
                stream::unfold(0_u8, |step| async move {
                    if step == 0 {
                        Some((Ok(1_u8), 1))
                    } else {
                        panic!("cleanup panicked")
                    }
                })
            })
            .unwrap();
        orchestrator
            .setup(&bridge, &def, &Request::new(&def, 0))
            .unwrap();
        orchestrator.finalize(&bridge, &Request::new(&def, 0));

        let err = orchestrator.drain(&bridge).unwrap_err();
        assert_eq!(
            err.to_string(),
            "async fixture did not stop: fragile (panicked: cleanup panicked)"
        );
    }

    #[test]
    fn test_drain_after_shutdown_is_loop_stopped() {
        let bridge = bridge();
        let orchestrator = FixtureOrchestrator::new();
        let stops = Arc::new(AtomicUsize::new(0));
        let def = generator("resource", &stops);
        for index in 0..2 {
            orchestrator
                .setup(&bridge, &def, &Request::new(&def, index))
                .unwrap();
            orchestrator.finalize(&bridge, &Request::new(&def, index));
        }

        bridge.shutdown();
        assert!(matches!(orchestrator.drain(&bridge), Err(Error::LoopStopped)));
        assert_eq!(stops.load(Ordering::SeqCst), 0);
        assert!(matches!(
            orchestrator.ensure_drained(),
            Err(Error::TeardownSkipped { pending: 0, queued: 1 })
        ));
    }

    #[test]
    fn test_module_scope_generator_kept_across_drains() {
        let bridge = bridge();
        let orchestrator = FixtureOrchestrator::new();
        let def = FixtureBuilder::new("shared")
            .scope(Scope::Module)
            .async_generator(|_| stream::iter(vec![Ok(1_u8)]))
            .unwrap();
        orchestrator
            .setup(&bridge, &def, &Request::new(&def, 0))
            .unwrap();
        orchestrator.drain(&bridge).unwrap();
        assert_eq!(orchestrator.pending_count(), 1);

        orchestrator.finalize(&bridge, &Request::new(&def, 0));
        orchestrator.drain(&bridge).unwrap();
        orchestrator.ensure_drained().unwrap();
    }
}
