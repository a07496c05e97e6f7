//! Process-wide reactor installation.

use std::sync::Arc;

use parking_lot::Mutex;

use super::{EventLoop, PumpHook, Reactor, ReactorKind};
use crate::error::{Error, Result};

static INSTALLED: Mutex<Option<Arc<dyn Reactor>>> = Mutex::new(None);

/// Installs the reactor backend of the given kind as the process-wide loop.
///
/// Installing is idempotent: when a reactor of the same kind is already
/// installed, the existing one is returned. [`ReactorKind::External`] starts
/// its loop on a dedicated thread before returning.
///
/// # Errors
///
/// Returns [`Error::WrongReactorAlreadyInstalled`] if a reactor of another
/// kind is installed, or [`Error::Body`] carrying the I/O error if the loop
/// thread of an external reactor could not be started.
pub fn install(kind: ReactorKind) -> Result<Arc<dyn Reactor>> {
    install_with_hooks(kind, &[])
}

/// Installs the reactor backend of the given kind, attaching `hooks` as pump
/// hooks of a [`ReactorKind::Ui`] loop.
///
/// The hooks are how a UI toolkit processes its own events while a test
/// blocks on the loop. They only take effect on a fresh install; when a
/// compatible reactor is already installed it is returned unchanged.
///
/// # Errors
///
/// The same as [`install`].
pub fn install_with_hooks(kind: ReactorKind, hooks: &[PumpHook]) -> Result<Arc<dyn Reactor>> {
    let mut installed = INSTALLED.lock();
    if let Some(existing) = installed.as_ref() {
        if !hooks.is_empty() {
            tracing::warn!(%kind, hooks = hooks.len(), "reactor already installed, pump hooks not attached");
        }
        return check_compatible(existing, kind);
    }

    let reactor: Arc<dyn Reactor> = match kind {
        ReactorKind::Default => Arc::new(EventLoop::new(kind)),
        ReactorKind::Ui => {
            let reactor = EventLoop::new(kind);
            for hook in hooks {
                reactor.add_pump_hook(Arc::clone(hook));
            }
            Arc::new(reactor)
        }
        ReactorKind::External => Arc::new(EventLoop::spawn_thread(kind).map_err(Error::body)?),
    };
    if kind != ReactorKind::Ui && !hooks.is_empty() {
        tracing::warn!(%kind, "pump hooks only apply to the ui reactor");
    }
    tracing::debug!(%kind, hooks = hooks.len(), "reactor installed");
    *installed = Some(Arc::clone(&reactor));
    Ok(reactor)
}

/// Installs a caller-built reactor as the process-wide loop.
///
/// The same compatibility rule as [`install`] applies: when a reactor of the
/// same kind is already installed, that one is kept and returned.
///
/// # Errors
///
/// Returns [`Error::WrongReactorAlreadyInstalled`] if a reactor of another
/// kind is installed.
pub fn install_custom(reactor: Arc<dyn Reactor>) -> Result<Arc<dyn Reactor>> {
    let mut installed = INSTALLED.lock();
    if let Some(existing) = installed.as_ref() {
        return check_compatible(existing, reactor.kind());
    }
    tracing::debug!(kind = %reactor.kind(), "custom reactor installed");
    *installed = Some(Arc::clone(&reactor));
    Ok(reactor)
}

/// Returns the installed reactor, if any.
#[must_use]
pub fn installed() -> Option<Arc<dyn Reactor>> {
    INSTALLED.lock().clone()
}

fn check_compatible(existing: &Arc<dyn Reactor>, expected: ReactorKind) -> Result<Arc<dyn Reactor>> {
    let found = existing.kind();
    if found == expected {
        tracing::trace!(kind = %found, "compatible reactor already installed");
        Ok(Arc::clone(existing))
    } else {
        Err(Error::WrongReactorAlreadyInstalled { expected, found })
    }
}
