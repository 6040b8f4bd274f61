//! Transport contract and the two strategies implementing it.
//!
//! A transport owns the [`ExchangeRegistry`] for the messages it has in
//! flight. Work that completes off the session queue (HTTP requests, the
//! socket reader, expiry timers) is reported through a
//! [`TransportLink`](crate::link::TransportLink); the session then hands the
//! event back to the transport, which correlates it against its registry and
//! returns [`Delivery`] values. Every outbound message yields exactly one reply
//! delivery: the server's, or a synthesized failure.

mod framing;
mod request;
mod streaming;

pub use framing::{ChunkAssembler, ResponseHead, ResponseReader};
pub use request::RequestTransport;
pub use streaming::StreamingTransport;

use async_trait::async_trait;
use base64::Engine;
use url::Url;

use crate::error::{CometError, Result, TransportError};
use crate::link::{TransportKind, TransportLink};
use crate::message::{Message, MessageId};
use crate::registry::{Delivery, ExchangeTimeouts};

/// Common contract for request/response and streaming transports.
#[async_trait]
pub trait Transport: Send {
    fn kind(&self) -> TransportKind;

    /// Register and send a batch.
    ///
    /// Failures that happen while sending are returned directly as failure
    /// deliveries. `Err` is reserved for invariant violations such as a
    /// duplicate message id.
    async fn send(&mut self, batch: Vec<Message>, timeouts: &ExchangeTimeouts) -> Result<Vec<Delivery>>;

    /// Correlate messages the transport's background work received.
    fn on_received(&mut self, batch: Vec<Message>) -> Vec<Delivery>;

    /// Apply a failure reported by the transport's background work.
    fn on_failed(&mut self, error: TransportError, batch: Vec<Message>) -> Vec<Delivery>;

    /// Apply an exchange expiry.
    fn on_expired(&mut self, id: &MessageId) -> Vec<Delivery>;

    /// Cancel all in-flight work and fail every pending exchange with
    /// [`TransportError::Aborted`].
    fn abort(&mut self) -> Vec<Delivery>;

    /// Number of exchanges still waiting for a reply.
    fn pending(&self) -> usize;
}

/// Builds transports for a connection cycle.
pub trait TransportFactory: Send + Sync {
    /// Create a transport of `kind` bound to `link`, or `None` if this factory
    /// does not provide that kind.
    fn create(&self, kind: TransportKind, link: TransportLink) -> Option<Box<dyn Transport>>;
}

/// Where and how to reach the server's Bayeux endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    url: Url,
    username: Option<String>,
    password: Option<String>,
    app_namespace: String,
}

impl Endpoint {
    pub fn new(url: &str, app_namespace: impl Into<String>) -> Result<Self> {
        let url = Url::parse(url).map_err(|e| CometError::InvalidUrl(format!("{}: {}", url, e)))?;
        if url.host_str().is_none() {
            return Err(CometError::InvalidUrl(format!("{} has no host", url)));
        }
        Ok(Self {
            url,
            username: None,
            password: None,
            app_namespace: app_namespace.into(),
        })
    }

    pub fn with_credentials(mut self, username: Option<String>, password: Option<String>) -> Self {
        self.username = username.filter(|u| !u.is_empty());
        self.password = password;
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    pub fn port(&self) -> u16 {
        self.url.port_or_known_default().unwrap_or(80)
    }

    pub fn app_namespace(&self) -> &str {
        &self.app_namespace
    }

    pub fn credentials(&self) -> Option<(&str, Option<&str>)> {
        self.username
            .as_deref()
            .map(|user| (user, self.password.as_deref()))
    }

    /// Value for an `Authorization: Basic ...` header.
    pub fn basic_auth(&self) -> Option<String> {
        let (user, password) = self.credentials()?;
        let token = format!("{}:{}", user, password.unwrap_or_default());
        Some(format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(token)
        ))
    }

    /// Path and query to put on a raw HTTP request line.
    pub fn request_target(&self) -> String {
        match self.url.query() {
            Some(query) => format!("{}?{}", self.url.path(), query),
            None => self.url.path().to_string(),
        }
    }
}

/// Creates the real HTTP transports for an [`Endpoint`].
#[derive(Debug, Clone)]
pub struct HttpTransportFactory {
    endpoint: Endpoint,
    client: reqwest::Client,
    streaming: bool,
}

impl HttpTransportFactory {
    pub fn new(endpoint: Endpoint, streaming: bool) -> Self {
        Self {
            endpoint,
            client: reqwest::Client::new(),
            streaming,
        }
    }
}

impl TransportFactory for HttpTransportFactory {
    fn create(&self, kind: TransportKind, link: TransportLink) -> Option<Box<dyn Transport>> {
        match kind {
            TransportKind::Request => Some(Box::new(RequestTransport::new(
                self.endpoint.clone(),
                self.client.clone(),
                link,
            ))),
            TransportKind::Streaming if self.streaming => {
                Some(Box::new(StreamingTransport::new(self.endpoint.clone(), link)))
            }
            TransportKind::Streaming => None,
        }
    }
}
