//! # reactor-bridge
//!
//! > Async tests and fixtures for a synchronous test harness
//!
//! **reactor-bridge** runs coroutine tests, inline-callback tests and async
//! fixtures on a callback-driven event loop while the harness calling them
//! stays synchronous. A blocking call hands control to the loop until the
//! awaited [`Deferred`](task::Deferred) resolves, then returns its value.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::time::Duration;
//! use reactor_bridge::prelude::*;
//!
//! #[reactor_bridge::test]
//! async fn test_with_clock(clock: MockClock) {
//!     clock.advance(Duration::from_secs(10));
//!     assert_eq!(clock.now(), Duration::from_secs(10));
//! }
//! ```
//!
//! ## Pieces
//!
//! - [`reactor`] - the event loop and process-wide reactor installation
//! - [`task`] - deferred handles, tasks and inline callbacks
//! - [`bridge`] - blocking on deferreds from synchronous code
//! - [`mark`] - classification of tests and fixtures
//! - [`fixture`] - async fixture definitions and their orchestrator
//! - [`invoke`] - running marked tests, with virtual clock stepping
//! - [`harness`] - a small harness wiring it all together
//! - [`clock`] - the virtual clock

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

/// Virtual clock for time control in tests
pub mod clock;

pub mod bridge;
pub mod error;
pub mod fixture;
pub mod harness;
pub mod invoke;
pub mod mark;
pub mod reactor;
pub mod task;

/// Prelude for convenient imports
///
/// ```rust
/// use reactor_bridge::prelude::*;
/// ```
pub mod prelude {
    pub use crate::bridge::{Bridge, BridgeConfig};
    pub use crate::clock::*;
    pub use crate::error::{Error, Result};
    pub use crate::fixture::{Args, FixtureBuilder, FixtureValue, Scope};
    pub use crate::harness::Session;
    pub use crate::invoke::{Funcargs, TestFn, TestInvoker};
    pub use crate::mark::Mark;
    pub use crate::reactor::{Reactor, ReactorKind};
    pub use crate::task::{Deferred, InlineStep};
}

// Re-exports
pub use bridge::Bridge;
pub use error::{Error, Result};

// Re-export the test macro when macros feature is enabled
#[cfg(feature = "macros")]
pub use reactor_bridge_macros::test;
