//! The mark registry.
//!
//! A [`Mark`] classifies a test or fixture by how its result must be
//! awaited. Marks live in a process-wide side table keyed by
//! [`CallableId`], minted once per definition, rather than in the callable
//! itself, so wrappers and clones of a definition share its mark.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Classification of a test or fixture callable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Mark {
    /// A test returning a deferred handle.
    PlainDeferred,
    /// A test written as an inline-callback generator.
    InlineCallbackTest,
    /// A test written as a future.
    CoroutineTest,
    /// A fixture whose body is a future.
    AsyncFixture,
    /// A fixture whose body is a stream yielding once, then finishing.
    AsyncGeneratorFixture,
    /// A future fixture providing a virtual clock.
    AutoClockFixture,
}

impl Mark {
    /// Returns the mark's name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Mark::PlainDeferred => "plain-deferred",
            Mark::InlineCallbackTest => "inline-callback-test",
            Mark::CoroutineTest => "coroutine-test",
            Mark::AsyncFixture => "async-fixture",
            Mark::AsyncGeneratorFixture => "async-generator-fixture",
            Mark::AutoClockFixture => "auto-clock-fixture",
        }
    }

    /// Returns true for the marks applied to fixtures.
    #[must_use]
    pub fn is_fixture(self) -> bool {
        matches!(
            self,
            Mark::AsyncFixture | Mark::AsyncGeneratorFixture | Mark::AutoClockFixture
        )
    }
}

impl fmt::Display for Mark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Stable identity of a test or fixture definition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CallableId(u64);

impl CallableId {
    /// Mints a new unique identity.
    #[must_use]
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw ID value.
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for CallableId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CallableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Callable({})", self.0)
    }
}

static MARKS: Mutex<Option<HashMap<CallableId, Mark>>> = Mutex::new(None);

/// Attaches `mark` to the callable `id`, named `name` in errors.
///
/// Marking again with the same mark is a no-op.
///
/// # Errors
///
/// Returns [`Error::MarkConflict`] if the callable already carries another
/// mark.
pub fn set_mark(id: CallableId, name: &str, mark: Mark) -> Result<()> {
    let mut marks = MARKS.lock();
    let marks = marks.get_or_insert_with(HashMap::new);
    match marks.get(&id) {
        Some(&existing) if existing != mark => Err(Error::MarkConflict {
            name: name.to_string(),
            existing,
            requested: mark,
        }),
        Some(_) => Ok(()),
        None => {
            tracing::trace!(%id, name, %mark, "callable marked");
            marks.insert(id, mark);
            Ok(())
        }
    }
}

/// Marks a callable whose id was just minted and so carries no mark yet.
pub(crate) fn mark_new(id: CallableId, mark: Mark) {
    let previous = MARKS.lock().get_or_insert_with(HashMap::new).insert(id, mark);
    debug_assert!(previous.is_none(), "{id} was already marked");
}

/// Returns the mark of the callable `id`, or `None` if it is unmarked.
#[must_use]
pub fn get_mark(id: CallableId) -> Option<Mark> {
    MARKS.lock().as_ref().and_then(|marks| marks.get(&id).copied())
}
