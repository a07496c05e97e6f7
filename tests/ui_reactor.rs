//! UI reactor installed with pump hooks. Runs in its own test binary so the
//! installed reactor is not shared with other tests.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use reactor_bridge::bridge::{Bridge, BridgeConfig};
use reactor_bridge::reactor::ReactorKind;
use reactor_bridge::task::Deferred;

static PUMPED: AtomicUsize = AtomicUsize::new(0);

/// Deferreds only the toolkit pump resolves.
static TOOLKIT_EVENTS: Mutex<Vec<Deferred<u32>>> = Mutex::new(Vec::new());

fn toolkit_pump() {
    PUMPED.fetch_add(1, Ordering::SeqCst);
    for event in TOOLKIT_EVENTS.lock().drain(..) {
        let _ = event.succeed(7);
    }
}

fn toolkit_event() -> Deferred<u32> {
    let event = Deferred::new();
    TOOLKIT_EVENTS.lock().push(event.clone());
    event
}

#[test]
fn test_installed_ui_reactor_pumps_while_blocked() {
    let config = BridgeConfig::new()
        .reactor(ReactorKind::Ui)
        .pump_hook(toolkit_pump);
    let bridge = Bridge::install(&config).unwrap();
    assert_eq!(bridge.reactor().kind(), ReactorKind::Ui);

    let value = bridge
        .run(async {
            toolkit_event()
                .await
                .map_err(|failure| reactor_bridge::Error::body(failure.to_string()))
        })
        .unwrap();
    assert_eq!(value, 7);
    assert!(PUMPED.load(Ordering::SeqCst) > 0);
}

#[cfg(feature = "macros")]
#[reactor_bridge::test(reactor = "ui", pump = "toolkit_pump")]
async fn test_macro_ui_reactor_pumps_while_blocked() {
    assert_eq!(toolkit_event().await.unwrap(), 7);
}
