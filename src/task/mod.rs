//! Deferred handles and tasks running on a reactor.
//!
//! A [`Deferred`] is the single-assignment result container every blocking
//! call waits on. Futures are turned into deferreds with [`spawn`], and
//! inline-callback generators with [`inline_callbacks`].
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use reactor_bridge::reactor::{EventLoop, Reactor, ReactorKind};
//! use reactor_bridge::task::spawn;
//!
//! let reactor: Arc<dyn Reactor> = Arc::new(EventLoop::new(ReactorKind::Default));
//! let deferred = spawn(&reactor, async { Ok(6 * 7) });
//!
//! let done = deferred.clone();
//! reactor.run_until(&|| done.is_resolved());
//! assert_eq!(deferred.wait().unwrap(), 42);
//! ```

mod deferred;
mod inline;
mod spawn;

use std::any::Any;
use std::fmt;
use std::panic;

pub use deferred::Deferred;
pub use inline::{inline_callbacks, InlineGenerator, InlineStep};
pub use spawn::{spawn, TaskId};

use crate::error::{Error, Result};
use crate::reactor::panic_message;

/// A type-erased value produced by a test or passed through an inline-callback
/// generator.
pub type Value = Box<dyn Any + Send>;

/// The failure side of a deferred outcome.
pub enum Failure {
    /// An error returned by the computation.
    Error(Error),
    /// A panic raised by the computation, with its original payload.
    Panic(Box<dyn Any + Send>),
}

/// The outcome a deferred resolves with.
pub type Outcome<T> = std::result::Result<T, Failure>;

impl Failure {
    /// Re-raises this failure in the calling context.
    ///
    /// Errors are returned as `Err`; panics resume unwinding with their
    /// original payload.
    pub fn raise<T>(self) -> Result<T> {
        match self {
            Failure::Error(error) => Err(error),
            Failure::Panic(payload) => panic::resume_unwind(payload),
        }
    }

    /// Returns true if this failure is a captured panic.
    #[must_use]
    pub fn is_panic(&self) -> bool {
        matches!(self, Failure::Panic(_))
    }
}

impl From<Error> for Failure {
    fn from(error: Error) -> Self {
        Failure::Error(error)
    }
}

impl fmt::Debug for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Error(error) => f.debug_tuple("Error").field(error).finish(),
            Failure::Panic(payload) => f
                .debug_tuple("Panic")
                .field(&panic_message(payload.as_ref()))
                .finish(),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Error(error) => write!(f, "{error}"),
            Failure::Panic(payload) => {
                write!(f, "panicked: {}", panic_message(payload.as_ref()))
            }
        }
    }
}

/// Converts an outcome back into a result, re-raising panics.
pub(crate) fn raise<T>(outcome: Outcome<T>) -> Result<T> {
    outcome.or_else(Failure::raise)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raise_error() {
        let failure = Failure::from(Error::ReactorIdle);
        assert!(!failure.is_panic());
        assert!(matches!(failure.raise::<()>(), Err(Error::ReactorIdle)));
    }

    #[test]
    #[should_panic(expected = "original cause")]
    fn test_raise_panic_resumes_payload() {
        let failure = Failure::Panic(Box::new("original cause"));
        assert!(failure.is_panic());
        let _ = failure.raise::<()>();
    }

    #[test]
    fn test_display() {
        assert_eq!(
            Failure::Error(Error::LoopStopped).to_string(),
            "loop has stopped"
        );
        assert_eq!(
            Failure::Panic(Box::new(String::from("bad"))).to_string(),
            "panicked: bad"
        );
    }
}
