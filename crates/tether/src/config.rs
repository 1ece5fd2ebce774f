//! Messenger configuration.

use std::time::Duration;

use tether_pending::SweepConfig;
use tether_registry::NamingConvention;

/// Configuration for a [`Messenger`](crate::Messenger).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessengerConfig {
    /// How long a host-issued call waits for the peer. `None` waits
    /// forever and runs no sweeper.
    pub call_timeout: Option<Duration>,

    /// How method names are folded at registration and lookup.
    pub naming: NamingConvention,

    /// Include diagnostic detail (the error's source chain) in `failed`
    /// replies. Off by default so internals don't leak to the peer.
    pub verbose_errors: bool,
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self {
            call_timeout: Some(SweepConfig::DEFAULT_TIMEOUT),
            naming: NamingConvention::default(),
            verbose_errors: false,
        }
    }
}

impl MessengerConfig {
    /// Settings for stepping through the peer in a debugger: calls never
    /// time out and failures carry full detail.
    pub fn debugging() -> Self {
        Self {
            call_timeout: None,
            verbose_errors: true,
            ..Self::default()
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            call_timeout: Some(timeout),
            ..Self::default()
        }
    }

    /// Clamps out-of-range values. Called by
    /// [`Messenger::new`](crate::Messenger::new).
    pub fn validated(mut self) -> Self {
        self.call_timeout = self.sweep_config().validated().timeout;
        self
    }

    pub(crate) fn sweep_config(&self) -> SweepConfig {
        SweepConfig {
            timeout: self.call_timeout,
        }
    }
}
