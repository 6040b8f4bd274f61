//! Configuration types for the squeeze-comet crate
//!
//! [`SessionConfig`] controls exchange timeouts, the handshake policy and the
//! reconnection backoff of a [`Session`](crate::Session).

use std::time::Duration;

use crate::error::{CometError, Result};
use crate::state::REHANDSHAKE_WINDOW;

/// Configuration for a Bayeux session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Network allowance added to every exchange timeout
    /// Default: 10 seconds
    pub base_network_delay: Duration,

    /// How long a handshake may take before the attempt is abandoned
    /// Default: 4 seconds
    pub handshake_timeout: Duration,

    /// How long a lost session may be re-established before giving up
    /// Default: 15 minutes
    pub rehandshake_window: Duration,

    /// Consecutive handshake failures treated as fatal while the network is up
    /// Default: 5
    pub max_handshake_failures: u32,

    /// First retry delay when the server advice carries no interval
    /// Default: 1 second
    pub retry_backoff_base: Duration,

    /// Upper bound for the retry delay
    /// Default: 30 seconds
    pub max_backoff: Duration,

    /// Application namespace of the server's channels (`/slim/...`)
    /// Default: "slim"
    pub app_namespace: String,

    /// Route control channels over a persistent streaming socket
    /// Default: true
    pub streaming_enabled: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            base_network_delay: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(4),
            rehandshake_window: REHANDSHAKE_WINDOW,
            max_handshake_failures: 5,
            retry_backoff_base: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            app_namespace: "slim".to_string(),
            streaming_enabled: true,
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_app_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.app_namespace = namespace.into();
        self
    }

    pub fn with_streaming(mut self, enabled: bool) -> Self {
        self.streaming_enabled = enabled;
        self
    }

    pub fn with_max_handshake_failures(mut self, failures: u32) -> Self {
        self.max_handshake_failures = failures;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_base_network_delay(mut self, delay: Duration) -> Self {
        self.base_network_delay = delay;
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.retry_backoff_base = base;
        self.max_backoff = max;
        self
    }

    /// Delay before retry number `failures` when the server gave no interval.
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        self.retry_backoff_base
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }

    /// Validate the configuration and return any issues
    pub fn validate(&self) -> Result<()> {
        if self.handshake_timeout == Duration::ZERO {
            return Err(CometError::Configuration(
                "Handshake timeout must be greater than 0".to_string(),
            ));
        }

        if self.max_handshake_failures == 0 {
            return Err(CometError::Configuration(
                "Max handshake failures must be greater than 0".to_string(),
            ));
        }

        if self.retry_backoff_base > self.max_backoff {
            return Err(CometError::Configuration(
                "Invalid backoff: base must not exceed max".to_string(),
            ));
        }

        if self.app_namespace.is_empty() || self.app_namespace.contains('/') {
            return Err(CometError::Configuration(format!(
                "Invalid application namespace: {:?}",
                self.app_namespace
            )));
        }

        Ok(())
    }
}
