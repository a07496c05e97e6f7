//! Virtual time.
//!
//! Tests that depend on an auto-clock fixture run under clock stepping: the
//! invoker advances a [`VirtualClock`] straight to the next pending delayed
//! call whenever the loop has nothing else to do. [`MockClock`] is the clock
//! shipped with the crate.
//!
//! # Example
//!
//! ```rust
//! use reactor_bridge::clock::MockClock;
//! use std::time::Duration;
//!
//! let clock = MockClock::new();
//! assert_eq!(clock.now(), Duration::ZERO);
//!
//! clock.advance(Duration::from_secs(10));
//! assert_eq!(clock.now(), Duration::from_secs(10));
//! ```

mod mock_clock;
mod timer;

use std::time::Duration;

pub use mock_clock::MockClock;
pub use timer::{DelayedCall, MockSleep};

/// A controllable time source.
pub trait VirtualClock: Send + Sync + 'static {
    /// Returns the current virtual time.
    fn now(&self) -> Duration;

    /// Returns the due times of all pending delayed calls, earliest first.
    fn pending_calls(&self) -> Vec<Duration>;

    /// Moves time forward by `amount`, running whatever comes due.
    fn advance(&self, amount: Duration);
}
