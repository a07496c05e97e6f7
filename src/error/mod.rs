//! Error definitions
//!
//! This module provides the error taxonomy shared by every part of the bridge:
//! configuration errors, scheduling contract violations, fixture teardown
//! violations and errors raised by test or fixture bodies.

use thiserror::Error;

use crate::fixture::Scope;
use crate::mark::Mark;
use crate::reactor::ReactorKind;

/// Boxed error returned by test and fixture bodies.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Main error type for reactor-bridge
#[derive(Error, Debug)]
pub enum Error {
    /// A reactor of another kind was installed before this one was requested.
    #[error("wrong reactor already installed: expected {expected} but found {found}")]
    WrongReactorAlreadyInstalled {
        /// The kind that was requested.
        expected: ReactorKind,
        /// The kind that is installed.
        found: ReactorKind,
    },

    /// The configured reactor name is not one of the known backends.
    #[error("unknown reactor {0:?}, expected one of: default, ui, external")]
    UnknownReactor(String),

    /// The fixture scope is not supported for async fixtures.
    #[error("unsupported scope used for async fixture: {0}")]
    UnsupportedScope(Scope),

    /// The scope name is not a harness scope.
    #[error("unknown fixture scope {0:?}")]
    UnknownScope(String),

    /// A mark was found where the bridge cannot dispatch on it.
    #[error("unrecognized mark {mark} on {name}")]
    UnrecognizedMark {
        /// Name of the test or fixture.
        name: String,
        /// The offending mark.
        mark: Mark,
    },

    /// A callable was marked twice with different marks.
    #[error("{name} is already marked {existing}, cannot mark it {requested}")]
    MarkConflict {
        /// Name of the callable.
        name: String,
        /// The mark already present.
        existing: Mark,
        /// The mark that was rejected.
        requested: Mark,
    },

    /// The body of a marked test did not have the shape its mark promises.
    #[error("{name} is marked {mark} but did not return a matching handle")]
    MarkMismatch {
        /// Name of the test.
        name: String,
        /// The mark of the test.
        mark: Mark,
    },

    /// No fixture with this name is registered with the harness.
    #[error("fixture {0:?} not found")]
    UnknownFixture(String),

    /// A declared argument was not provided by the harness.
    #[error("missing argument {0:?}")]
    MissingArgument(String),

    /// A fixture value was requested as the wrong type.
    #[error("argument {name:?} is not a {expected}")]
    ArgumentType {
        /// Argument name.
        name: String,
        /// The requested type.
        expected: &'static str,
    },

    /// The loop fiber has terminated; no further blocking calls are possible.
    #[error("loop has stopped")]
    LoopStopped,

    /// The external loop is not running.
    #[error("loop is not running")]
    LoopNotRunning,

    /// A deferred handle was resolved twice.
    #[error("deferred already resolved")]
    AlreadyResolved,

    /// An async generator fixture produced a value or an error on its final step.
    #[error("async fixture did not stop: {fixture} ({reason})")]
    AsyncFixtureDidNotStop {
        /// Name of the fixture.
        fixture: String,
        /// What happened instead of exhaustion.
        reason: String,
    },

    /// An async generator fixture finished without yielding its value.
    #[error("async fixture did not yield: {0}")]
    AsyncFixtureDidNotYield(String),

    /// Generator teardown was skipped for some fixture instantiations.
    #[error("async fixture teardown skipped: {pending} pending, {queued} queued")]
    TeardownSkipped {
        /// Generators that were never finalized.
        pending: usize,
        /// Teardown steps that were never drained.
        queued: usize,
    },

    /// Clock stepping found nothing left to advance to.
    #[error("reactor idle: the test is not complete and no delayed calls are pending")]
    ReactorIdle,

    /// Error raised by a test or fixture body.
    #[error(transparent)]
    Body(BoxError),
}

impl Error {
    /// Create a body error from any error type.
    #[must_use]
    pub fn body(error: impl Into<BoxError>) -> Self {
        Self::Body(error.into())
    }

    /// Create an "async fixture did not stop" error.
    #[must_use]
    pub fn did_not_stop(fixture: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::AsyncFixtureDidNotStop {
            fixture: fixture.into(),
            reason: reason.into(),
        }
    }

    /// Returns the body error if this error was raised by a test or fixture.
    #[must_use]
    pub fn into_body(self) -> Option<BoxError> {
        match self {
            Self::Body(error) => Some(error),
            _ => None,
        }
    }

    /// Returns a reference to the body error, if any.
    #[must_use]
    pub fn as_body(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        match self {
            Self::Body(error) => Some(error.as_ref()),
            _ => None,
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("boom {0}")]
    struct Boom(u32);

    #[test]
    fn test_wrong_reactor_message_names_both_kinds() {
        let err = Error::WrongReactorAlreadyInstalled {
            expected: ReactorKind::Ui,
            found: ReactorKind::Default,
        };
        assert_eq!(
            err.to_string(),
            "wrong reactor already installed: expected ui but found default"
        );
    }

    #[test]
    fn test_body_error_is_transparent() {
        let err = Error::body(Boom(7));
        assert_eq!(err.to_string(), "boom 7");
        let body = err.into_body().unwrap();
        assert_eq!(body.downcast_ref::<Boom>().unwrap().0, 7);
    }

    #[test]
    fn test_did_not_stop_message() {
        let err = Error::did_not_stop("db", "yielded another value");
        assert_eq!(
            err.to_string(),
            "async fixture did not stop: db (yielded another value)"
        );
        assert!(err.as_body().is_none());
    }
}
