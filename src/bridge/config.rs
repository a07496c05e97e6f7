//! Bridge configuration.

use std::env;
use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::reactor::{PumpHook, ReactorKind};

/// Environment variable selecting the reactor backend.
pub const REACTOR_ENV: &str = "REACTOR_BRIDGE_REACTOR";

/// Configuration consumed once when the process-wide bridge is installed.
///
/// # Example
///
/// ```rust
/// use reactor_bridge::bridge::BridgeConfig;
/// use reactor_bridge::reactor::ReactorKind;
///
/// let config = BridgeConfig::new().reactor(ReactorKind::Ui);
/// assert_eq!(config.reactor_kind(), ReactorKind::Ui);
/// ```
#[derive(Clone)]
pub struct BridgeConfig {
    reactor: ReactorKind,
    pumps: Vec<PumpHook>,
}

impl BridgeConfig {
    /// Creates a configuration selecting the default reactor.
    #[must_use]
    pub fn new() -> Self {
        Self {
            reactor: ReactorKind::Default,
            pumps: Vec::new(),
        }
    }

    /// Selects the reactor backend.
    #[must_use]
    pub fn reactor(mut self, kind: ReactorKind) -> Self {
        self.reactor = kind;
        self
    }

    /// Adds a pump hook for the [`ReactorKind::Ui`] loop, run on every loop
    /// iteration while a caller blocks on it.
    #[must_use]
    pub fn pump_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.pumps.push(Arc::new(hook));
        self
    }

    /// Returns the configured pump hooks.
    #[must_use]
    pub fn pump_hooks(&self) -> &[PumpHook] {
        &self.pumps
    }

    /// Returns the selected reactor backend.
    #[must_use]
    pub fn reactor_kind(&self) -> ReactorKind {
        self.reactor
    }

    /// Reads the configuration from [`REACTOR_ENV`].
    ///
    /// An unset or empty variable selects the default reactor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownReactor`](crate::Error::UnknownReactor) if the
    /// variable names no known backend.
    pub fn from_env() -> Result<Self> {
        Self::from_selector(env::var(REACTOR_ENV).ok().as_deref())
    }

    fn from_selector(selector: Option<&str>) -> Result<Self> {
        let config = match selector.map(str::trim) {
            None | Some("") => Self::new(),
            Some(name) => Self::new().reactor(name.parse()?),
        };
        Ok(config)
    }
}

impl fmt::Debug for BridgeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeConfig")
            .field("reactor", &self.reactor)
            .field("pumps", &self.pumps.len())
            .finish()
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::new()
    }
}
