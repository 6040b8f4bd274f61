//! Configuration for the squeeze client
//!
//! [`ServerConfig`] says where the media server lives and is diffed by
//! [`CometClient::reconnect_if_changed`](crate::CometClient::reconnect_if_changed).
//! [`ClientConfig`] tunes the session and the background worker.

use squeeze_comet::SessionConfig;

use crate::error::{ClientError, Result};

/// Address and credentials of a media server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,

    /// Default: 9000
    pub port: u16,

    /// Path of the Bayeux endpoint
    /// Default: "/cometd"
    pub cometd_path: String,

    /// Path of the JSON-RPC control endpoint
    /// Default: "/jsonrpc.js"
    pub control_path: String,

    pub username: Option<String>,
    pub password: Option<String>,
}

impl ServerConfig {
    pub const DEFAULT_PORT: u16 = 9000;

    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: Self::DEFAULT_PORT,
            cometd_path: "/cometd".to_string(),
            control_path: "/jsonrpc.js".to_string(),
            username: None,
            password: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Read `SQUEEZE_HOST`, `SQUEEZE_PORT`, `SQUEEZE_USER` and `SQUEEZE_PASSWORD`.
    ///
    /// Returns `None` when no host is configured.
    pub fn from_env() -> Result<Option<Self>> {
        let Some(host) = env_value("SQUEEZE_HOST") else {
            return Ok(None);
        };
        let mut config = Self::new(host);
        if let Some(port) = env_value("SQUEEZE_PORT") {
            config.port = port
                .parse()
                .map_err(|_| ClientError::InvalidConfiguration(format!("SQUEEZE_PORT={}", port)))?;
        }
        config.username = env_value("SQUEEZE_USER");
        config.password = env_value("SQUEEZE_PASSWORD");
        Ok(Some(config))
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn cometd_url(&self) -> String {
        format!("{}{}", self.base_url(), with_leading_slash(&self.cometd_path))
    }

    pub fn control_url(&self) -> String {
        format!("{}{}", self.base_url(), with_leading_slash(&self.control_path))
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(ClientError::InvalidConfiguration(
                "host must not be empty".to_string(),
            ));
        }
        if self.port == 0 {
            return Err(ClientError::InvalidConfiguration(
                "port must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn with_leading_slash(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    }
}

/// Configuration for the client and its background worker
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Session timeouts, handshake policy and backoff
    pub session: SessionConfig,

    /// Threads of the worker runtime (socket reads, HTTP and timers)
    /// Default: half the available CPUs, at least one
    pub worker_threads: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            session: SessionConfig::default(),
            worker_threads: (cpus / 2).max(1),
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_threads == 0 {
            return Err(ClientError::InvalidConfiguration(
                "worker_threads must be greater than 0".to_string(),
            ));
        }
        self.session.validate()?;
        Ok(())
    }
}
