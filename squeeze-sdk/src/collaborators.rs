//! Seams to the host application.
//!
//! The client asks a [`ConfigProvider`] where the server is every time it
//! connects, asks a [`ConnectivityProbe`] whether failures are the network's
//! fault, and tells a [`ShutdownHandler`] when it has given up for good.

use std::sync::RwLock;

use squeeze_comet::{Endpoint, HttpTransportFactory, TransportFactory};

use crate::config::ServerConfig;

pub use squeeze_comet::{AlwaysReachable, ConnectivityProbe};

/// Source of the server address and credentials.
pub trait ConfigProvider: Send + Sync {
    fn server_config(&self) -> ServerConfig;
}

/// A [`ConfigProvider`] holding one value that the host may replace.
#[derive(Debug)]
pub struct StaticConfig {
    config: RwLock<ServerConfig>,
}

impl StaticConfig {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config: RwLock::new(config),
        }
    }

    /// Replace the configuration returned from now on.
    pub fn replace(&self, config: ServerConfig) {
        match self.config.write() {
            Ok(mut current) => *current = config,
            Err(poisoned) => *poisoned.into_inner() = config,
        }
    }
}

impl ConfigProvider for StaticConfig {
    fn server_config(&self) -> ServerConfig {
        match self.config.read() {
            Ok(config) => config.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

/// Receives the request to stop the process after a fatal session failure.
pub trait ShutdownHandler: Send + Sync {
    /// Whether a UI or control surface is currently showing.
    fn surfaces_active(&self) -> bool;

    fn request_shutdown(&self);
}

/// Ignores shutdown requests.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopShutdown;

impl ShutdownHandler for NoopShutdown {
    fn surfaces_active(&self) -> bool {
        true
    }

    fn request_shutdown(&self) {}
}

/// Builds the transport factory for one connection.
pub trait TransportBuilder: Send + Sync {
    fn build(&self, endpoint: Endpoint, streaming: bool) -> Box<dyn TransportFactory>;
}

/// Real HTTP and streaming-socket transports.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpTransports;

impl TransportBuilder for HttpTransports {
    fn build(&self, endpoint: Endpoint, streaming: bool) -> Box<dyn TransportFactory> {
        Box::new(HttpTransportFactory::new(endpoint, streaming))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_config_replace() {
        let provider = StaticConfig::new(ServerConfig::new("a.local"));
        assert_eq!(provider.server_config().host, "a.local");

        provider.replace(ServerConfig::new("b.local"));
        assert_eq!(provider.server_config().host, "b.local");
    }

    #[test]
    fn test_noop_shutdown_keeps_running() {
        assert!(NoopShutdown.surfaces_active());
    }
}
