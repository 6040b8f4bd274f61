//! Persistent-socket transport for the control channels.
//!
//! Handshake, connect and subscribe traffic shares one raw HTTP/1.1 socket.
//! A reader task owns the read half and pushes decoded messages back through
//! the [`TransportLink`]; only the transport itself writes to the socket.

use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::framing::ResponseReader;
use super::{Endpoint, Transport};
use crate::error::{Result, TransportError};
use crate::link::{TransportKind, TransportLink};
use crate::message::{Message, MessageClass, MessageId};
use crate::registry::{ChannelMatch, Delivery, ExchangeRegistry, ExchangeTimeouts};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

struct Connection {
    writer: OwnedWriteHalf,
    reader: JoinHandle<()>,
    cancel: CancellationToken,
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.reader.abort();
    }
}

/// Streaming transport over a single persistent socket.
pub struct StreamingTransport {
    endpoint: Endpoint,
    registry: ExchangeRegistry,
    link: TransportLink,
    connection: Option<Connection>,
    connect_sent: bool,
}

impl StreamingTransport {
    pub fn new(endpoint: Endpoint, link: TransportLink) -> Self {
        Self {
            endpoint,
            registry: ExchangeRegistry::new(link.clone()),
            link,
            connection: None,
            connect_sent: false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.connection.is_some()
    }

    /// Close the socket and fail every open exchange with `cause`.
    fn teardown(&mut self, cause: &TransportError) -> Vec<Delivery> {
        if self.connection.take().is_some() {
            tracing::debug!(error = %cause, "closing streaming socket");
        }
        self.connect_sent = false;
        self.registry.fail_all(cause)
    }

    async fn open(&mut self) -> std::result::Result<(), TransportError> {
        if self.connection.is_some() {
            return Ok(());
        }

        let address = (self.endpoint.host().to_string(), self.endpoint.port());
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(address))
            .await
            .map_err(|_| TransportError::Connect("connect timed out".to_string()))?
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        stream.set_nodelay(true)?;

        let (read_half, writer) = stream.into_split();
        let cancel = CancellationToken::new();
        let reader = tokio::spawn(read_loop(read_half, self.link.clone(), cancel.clone()));

        tracing::debug!(host = self.endpoint.host(), port = self.endpoint.port(), "streaming socket open");
        self.connection = Some(Connection {
            writer,
            reader,
            cancel,
        });
        Ok(())
    }

    async fn write(&mut self, batch: &[Message]) -> std::result::Result<(), TransportError> {
        let body = serde_json::to_vec(batch).map_err(|e| TransportError::Framing(e.to_string()))?;
        let request = encode_request(&self.endpoint, &body);

        let connection = self.connection.as_mut().ok_or(TransportError::Closed)?;
        connection.writer.write_all(&request).await?;
        connection.writer.flush().await?;
        Ok(())
    }

    fn recover_id(&self, message: &mut Message) {
        if message.id.is_some() {
            return;
        }

        let (found, rule) = if message.is_meta() {
            let channel = message.channel().unwrap_or_default();
            (self.registry.match_channel(channel), "channel")
        } else if message.channel.is_none() && message.has_actionable_advice() {
            let found = self
                .registry
                .match_class(&[MessageClass::Handshake, MessageClass::Connect]);
            (found, "advice")
        } else {
            return;
        };

        match found {
            ChannelMatch::Unique(id) => {
                tracing::debug!(%id, rule, "recovered missing reply id");
                message.id = Some(id);
            }
            ChannelMatch::Ambiguous(count) => {
                tracing::error!(
                    channel = ?message.channel,
                    outstanding = count,
                    rule,
                    "reply without id matches several outstanding requests, not correlating"
                );
            }
            ChannelMatch::None => {}
        }
    }
}

/// Serialize a POST of `body` to the endpoint as raw HTTP/1.1.
pub(crate) fn encode_request(endpoint: &Endpoint, body: &[u8]) -> BytesMut {
    let mut head = format!(
        "POST {} HTTP/1.1\r\nHost: {}:{}\r\nContent-Type: application/json;charset=UTF-8\r\nContent-Length: {}\r\n",
        endpoint.request_target(),
        endpoint.host(),
        endpoint.port(),
        body.len()
    );
    if let Some(auth) = endpoint.basic_auth() {
        head.push_str(&format!("Authorization: {}\r\n", auth));
    }
    head.push_str("\r\n");

    let mut request = BytesMut::with_capacity(head.len() + body.len());
    request.put_slice(head.as_bytes());
    request.put_slice(body);
    request
}

async fn read_loop(read_half: OwnedReadHalf, link: TransportLink, cancel: CancellationToken) {
    let mut responses = ResponseReader::new(BufReader::new(read_half));
    let sink_link = link.clone();
    let mut sink = move |batch: Vec<Message>| sink_link.received(batch);

    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::trace!("streaming reader cancelled");
                return;
            }
            result = responses.read_response(&mut sink) => result,
        };

        if let Err(error) = result {
            if cancel.is_cancelled() {
                return;
            }
            tracing::warn!(%error, "streaming socket failed");
            link.failed(error, Vec::new());
            return;
        }
    }
}

#[async_trait]
impl Transport for StreamingTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Streaming
    }

    async fn send(&mut self, batch: Vec<Message>, timeouts: &ExchangeTimeouts) -> Result<Vec<Delivery>> {
        let mut deliveries = Vec::new();
        let mut outgoing = Vec::with_capacity(batch.len());

        for message in batch {
            match message.class() {
                MessageClass::Handshake => deliveries.extend(self.teardown(&TransportError::Aborted)),
                MessageClass::Connect if self.connect_sent => {
                    tracing::debug!(id = ?message.id, "connect already sent on this socket, dropping");
                    continue;
                }
                MessageClass::Connect => self.connect_sent = true,
                _ => {}
            }
            outgoing.push(message);
        }

        if outgoing.is_empty() {
            return Ok(deliveries);
        }

        self.registry.register_batch(&outgoing, timeouts)?;

        let sent = match self.open().await {
            Ok(()) => self.write(&outgoing).await,
            Err(error) => Err(error),
        };
        if let Err(error) = sent {
            tracing::warn!(%error, "streaming send failed");
            deliveries.extend(self.teardown(&error));
        }
        Ok(deliveries)
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

    fn on_failed(&mut self, error: TransportError, _batch: Vec<Message>) -> Vec<Delivery> {
        self.teardown(&error)
    }

    fn on_expired(&mut self, id: &MessageId) -> Vec<Delivery> {
        if !self.registry.contains(id) {
            return Vec::new();
        }
        tracing::debug!(%id, "exchange expired on the shared socket");
        self.teardown(&TransportError::Timeout)
    }

    fn abort(&mut self) -> Vec<Delivery> {
        self.teardown(&TransportError::Aborted)
    }

    fn pending(&self) -> usize {
        self.registry.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::Inbound;
    use crate::message::Advice;
    use crate::message::Reconnect;
    use tokio::sync::mpsc;

    fn transport() -> (StreamingTransport, mpsc::UnboundedReceiver<Inbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let link = TransportLink::new(1, TransportKind::Streaming, tx);
        let endpoint = Endpoint::new("http://127.0.0.1:9000/cometd", "slim").unwrap();
        (StreamingTransport::new(endpoint, link), rx)
    }

    #[test]
    fn test_encode_request() {
        let endpoint = Endpoint::new("http://lms:9000/cometd", "slim")
            .unwrap()
            .with_credentials(Some("user".to_string()), Some("pass".to_string()));
        let request = encode_request(&endpoint, b"[]");
        let text = String::from_utf8(request.to_vec()).unwrap();

        assert!(text.starts_with("POST /cometd HTTP/1.1\r\n"));
        assert!(text.contains("Host: lms:9000\r\n"));
        assert!(text.contains("Content-Length: 2\r\n"));
        assert!(text.contains("Authorization: Basic dXNlcjpwYXNz\r\n"));
        assert!(text.ends_with("\r\n\r\n[]"));
    }

    #[tokio::test]
    async fn test_advice_only_reply_binds_to_connect() {
        let (mut transport, _rx) = transport();
        let connect = Message::connect(MessageId::from(2), "abc", "streaming");
        transport
            .registry
            .register(connect, Duration::from_secs(10))
            .unwrap();

        let reply = Message {
            successful: Some(false),
            advice: Some(Advice::new(Reconnect::Retry).with_interval(0)),
            ..Default::default()
        };
        match transport.on_received(vec![reply]).as_slice() {
            [Delivery::Reply { request, reply }] => {
                assert_eq!(request.id, Some(MessageId::from(2)));
                assert_eq!(reply.channel(), Some("/meta/connect"));
            }
            other => panic!("expected connect reply, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_channel_less_reply_without_advice_is_dropped() {
        let (mut transport, _rx) = transport();
        let connect = Message::connect(MessageId::from(2), "abc", "streaming");
        transport
            .registry
            .register(connect, Duration::from_secs(10))
            .unwrap();

        let reply = Message {
            successful: Some(true),
            ..Default::default()
        };
        assert!(transport.on_received(vec![reply]).is_empty());
        assert_eq!(transport.pending(), 1);
    }

    #[tokio::test]
    async fn test_failure_tears_down_everything() {
        let (mut transport, _rx) = transport();
        for id in 1..=2u64 {
            let subscribe = Message::subscribe(MessageId::from(id), "abc", "/abc/x");
            transport
                .registry
                .register(subscribe, Duration::from_secs(10))
                .unwrap();
        }
        transport.connect_sent = true;

        let failed = transport.on_failed(TransportError::Closed, Vec::new());
        assert_eq!(failed.len(), 2);
        assert_eq!(transport.pending(), 0);
        assert!(!transport.connect_sent);
    }

    #[tokio::test]
    async fn test_expiry_of_unknown_id_is_ignored() {
        let (mut transport, _rx) = transport();
        assert!(transport.on_expired(&MessageId::from(9)).is_empty());
    }
}
