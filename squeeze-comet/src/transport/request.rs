//! One HTTP POST per outbound batch.

use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use tokio::task::AbortHandle;
use url::Url;

use async_trait::async_trait;

use super::{Endpoint, Transport};
use crate::error::{Result, TransportError};
use crate::link::{TransportKind, TransportLink};
use crate::message::{channel, messages_from_value, Message, MessageId};
use crate::registry::{ChannelMatch, Delivery, ExchangeRegistry, ExchangeTimeouts};

/// Request/response transport backed by `reqwest`.
pub struct RequestTransport {
    endpoint: Endpoint,
    client: reqwest::Client,
    registry: ExchangeRegistry,
    link: TransportLink,
    in_flight: Vec<AbortHandle>,
}

impl RequestTransport {
    pub fn new(endpoint: Endpoint, client: reqwest::Client, link: TransportLink) -> Self {
        Self {
            endpoint,
            client,
            registry: ExchangeRegistry::new(link.clone()),
            link,
            in_flight: Vec::new(),
        }
    }

    /// URL to post `batch` to.
    ///
    /// A batch holding a single meta message gets the meta type appended to
    /// the path (`/cometd` becomes `/cometd/handshake`) unless the configured
    /// URL already names a resource or carries a query.
    pub fn url_for(&self, batch: &[Message]) -> Url {
        let base = self.endpoint.url();
        let meta_type = match batch {
            [only] => only.channel().and_then(channel::meta_type),
            _ => None,
        };

        match meta_type {
            Some(meta_type) if !has_explicit_suffix(base) => {
                let mut url = base.clone();
                if let Ok(mut segments) = url.path_segments_mut() {
                    segments.pop_if_empty().push(meta_type);
                }
                url
            }
            _ => base.clone(),
        }
    }

    fn recover_id(&self, message: &mut Message) {
        if message.id.is_some() {
            return;
        }
        let Some(channel) = message.channel() else {
            return;
        };
        match self.registry.match_channel(channel) {
            ChannelMatch::Unique(id) => {
                tracing::debug!(%id, channel, "recovered missing reply id by channel");
                message.id = Some(id);
            }
            ChannelMatch::Ambiguous(count) => {
                tracing::error!(
                    channel,
                    outstanding = count,
                    "reply without id matches several outstanding requests, not correlating"
                );
            }
            ChannelMatch::None => {}
        }
    }
}

fn has_explicit_suffix(url: &Url) -> bool {
    url.query().is_some()
        || url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .is_some_and(|last| last.contains('.'))
}

/// Drop the data the server echoes on application-namespace replies.
///
/// The server copies the request data onto negative acknowledgements of
/// unsubscribe requests, which would otherwise make the reply look like a
/// fresh push.
pub(crate) fn strip_echoed_data(replies: &mut [Message], namespace: &str) {
    for reply in replies.iter_mut() {
        if reply.channel().is_some_and(|ch| channel::is_app(ch, namespace)) {
            reply.data = None;
        }
    }
}

async fn execute(request: reqwest::RequestBuilder, namespace: &str) -> std::result::Result<Vec<Message>, TransportError> {
    let response = request.send().await?;
    let status = response.status();
    if status != StatusCode::OK {
        return Err(TransportError::Status(status.as_u16()));
    }

    let body = response.bytes().await?;
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(TransportError::NoContent);
    }

    let value = serde_json::from_slice(&body).map_err(|e| TransportError::Framing(e.to_string()))?;
    let mut replies = messages_from_value(value).map_err(|e| TransportError::Framing(e.to_string()))?;
    strip_echoed_data(&mut replies, namespace);
    Ok(replies)
}

#[async_trait]
impl Transport for RequestTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Request
    }

    async fn send(&mut self, batch: Vec<Message>, timeouts: &ExchangeTimeouts) -> Result<Vec<Delivery>> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        self.registry.register_batch(&batch, timeouts)?;

        let url = self.url_for(&batch);
        let body = serde_json::to_vec(&batch)?;
        let mut request = self
            .client
            .post(url.clone())
            .header(CONTENT_TYPE, "application/json;charset=UTF-8")
            .body(body);
        if let Some((user, password)) = self.endpoint.credentials() {
            request = request.basic_auth(user, password);
        }

        tracing::debug!(%url, messages = batch.len(), "posting batch");

        let namespace = self.endpoint.app_namespace().to_string();
        let link = self.link.clone();
        let handle = tokio::spawn(async move {
            match execute(request, &namespace).await {
                Ok(replies) => link.received(replies),
                Err(error) => {
                    tracing::debug!(%error, "batch request failed");
                    link.failed(error, batch);
                }
            }
        })
        .abort_handle();

        self.in_flight.retain(|handle| !handle.is_finished());
        self.in_flight.push(handle);
        Ok(Vec::new())
    }

    fn on_received(&mut self, batch: Vec<Message>) -> Vec<Delivery> {
        batch
            .into_iter()
            .filter_map(|mut message| {
                self.recover_id(&mut message);
                self.registry.correlate(message)
            })
            .collect()
    }

    fn on_failed(&mut self, error: TransportError, batch: Vec<Message>) -> Vec<Delivery> {
        batch
            .iter()
            .filter_map(|message| message.id.as_ref())
            .filter_map(|id| self.registry.fail(id, &error))
            .collect()
    }

    fn on_expired(&mut self, id: &MessageId) -> Vec<Delivery> {
        self.registry.expire(id).into_iter().collect()
    }

    fn abort(&mut self) -> Vec<Delivery> {
        for handle in self.in_flight.drain(..) {
            handle.abort();
        }
        self.registry.fail_all(&TransportError::Aborted)
    }

    fn pending(&self) -> usize {
        self.registry.len()
    }
}

impl Drop for RequestTransport {
    fn drop(&mut self) {
        for handle in self.in_flight.drain(..) {
            handle.abort();
        }
    }
}
