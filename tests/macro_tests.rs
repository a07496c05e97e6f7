//! Integration tests for the `#[reactor_bridge::test]` macro.

#![cfg(feature = "macros")]
// MockClock is used in function signatures but injected by the macro
#![allow(unused_imports)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reactor_bridge::clock::MockClock;
use reactor_bridge::reactor::in_loop_context;
use reactor_bridge::task::Deferred;

/// Basic test without clock injection.
#[reactor_bridge::test]
async fn test_basic_async() {
    assert_eq!(2 + 2, 4);
}

/// The body runs inside the loop.
#[reactor_bridge::test]
async fn test_body_runs_on_loop() {
    assert!(in_loop_context());
}

/// Test with MockClock injection.
#[reactor_bridge::test]
async fn test_with_clock(clock: MockClock) {
    assert_eq!(clock.now(), Duration::ZERO);

    clock.advance(Duration::from_secs(10));
    assert_eq!(clock.now(), Duration::from_secs(10));
}

/// Test with custom start time.
#[reactor_bridge::test(start_time = 1000)]
async fn test_start_time(clock: MockClock) {
    assert_eq!(clock.now(), Duration::from_secs(1000));
}

/// The stepped clock completes sleeps without explicit advancing.
#[reactor_bridge::test(auto_clock = true)]
async fn test_auto_clock_steps_sleeps(clock: MockClock) {
    clock.sleep(Duration::from_secs(60)).await;
    clock.sleep(Duration::from_secs(30)).await;
    assert_eq!(clock.now(), Duration::from_secs(90));
}

/// A delayed call scheduled on the clock fires as the clock is stepped.
#[reactor_bridge::test(auto_clock = true, start_time = 5)]
async fn test_auto_clock_fires_delayed_calls(clock: MockClock) {
    let fired = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&fired);
    clock.call_later(Duration::from_secs(2), move || flag.store(true, Ordering::SeqCst));

    clock.sleep(Duration::from_secs(3)).await;
    assert!(fired.load(Ordering::SeqCst));
    assert_eq!(clock.now(), Duration::from_secs(8));
}

/// Awaiting a deferred resolved later on the loop.
#[reactor_bridge::test]
async fn test_await_deferred() {
    let deferred = Deferred::new();
    let resolver = deferred.clone();
    std::thread::spawn(move || {
        resolver.succeed("from a thread").unwrap();
    });
    assert_eq!(deferred.await.unwrap(), "from a thread");
}

/// A body returning `Ok` passes.
#[reactor_bridge::test]
async fn test_result_ok() -> Result<(), std::io::Error> {
    Ok(())
}

/// A body returning `Err` fails the test.
#[reactor_bridge::test]
#[should_panic(expected = "connection refused")]
async fn test_result_err() -> Result<(), std::io::Error> {
    Err(std::io::Error::new(
        std::io::ErrorKind::ConnectionRefused,
        "connection refused",
    ))
}

/// A panic in the body keeps its message.
#[reactor_bridge::test]
#[should_panic(expected = "assertion in async body")]
async fn test_panic_propagates() {
    let ready = false;
    assert!(ready, "assertion in async body");
}
