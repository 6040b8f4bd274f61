//! Bayeux message envelopes and channel naming.
//!
//! Only the subset of the protocol the client needs is modelled: handshake,
//! connect, subscribe, unsubscribe, disconnect, publish and advice.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::TransportError;

/// Well-known meta channels.
pub mod channel {
    pub const META_HANDSHAKE: &str = "/meta/handshake";
    pub const META_CONNECT: &str = "/meta/connect";
    pub const META_SUBSCRIBE: &str = "/meta/subscribe";
    pub const META_UNSUBSCRIBE: &str = "/meta/unsubscribe";
    pub const META_DISCONNECT: &str = "/meta/disconnect";

    const META_PREFIX: &str = "/meta/";

    /// Whether the channel belongs to the `/meta/` namespace.
    pub fn is_meta(channel: &str) -> bool {
        channel.starts_with(META_PREFIX)
    }

    /// The meta type name (`"handshake"`, `"connect"`, ...) of a meta channel.
    pub fn meta_type(channel: &str) -> Option<&str> {
        channel.strip_prefix(META_PREFIX).filter(|t| !t.is_empty())
    }

    /// Whether the channel lives under the application namespace, e.g. `/slim/...`.
    pub fn is_app(channel: &str, namespace: &str) -> bool {
        channel
            .strip_prefix('/')
            .and_then(|rest| rest.strip_prefix(namespace))
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
    }

    /// `/<app>/subscribe`
    pub fn app_subscribe(namespace: &str) -> String {
        format!("/{}/subscribe", namespace)
    }

    /// `/<app>/unsubscribe`
    pub fn app_unsubscribe(namespace: &str) -> String {
        format!("/{}/unsubscribe", namespace)
    }

    /// `/<clientId>/<app>/playerstatus/<playerId>`
    pub fn player_status(client_id: &str, namespace: &str, player_id: &str) -> String {
        format!("/{}/{}/playerstatus/{}", client_id, namespace, player_id)
    }

    /// `/<clientId>/<app>/playerstatus/*`, the broadcast status channel.
    pub fn player_status_broadcast(client_id: &str, namespace: &str) -> String {
        format!("/{}/{}/playerstatus/*", client_id, namespace)
    }

    /// Extract the player id from a player status push channel.
    pub fn player_from_status_channel<'a>(channel: &'a str, namespace: &str) -> Option<&'a str> {
        let mut parts = channel.strip_prefix('/')?.splitn(4, '/');
        let _client_id = parts.next()?;
        if parts.next()? != namespace || parts.next()? != "playerstatus" {
            return None;
        }
        parts.next().filter(|player| !player.is_empty() && *player != "*")
    }
}

/// Correlation id of a Bayeux message.
///
/// Servers are inconsistent about sending ids as strings or numbers, so both
/// are accepted and normalised to their string form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Create a new message id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<u64> for MessageId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<'de> Deserialize<'de> for MessageId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawId {
            Text(String),
            Number(serde_json::Number),
        }

        Ok(match RawId::deserialize(deserializer)? {
            RawId::Text(text) => MessageId(text),
            RawId::Number(number) => MessageId(number.to_string()),
        })
    }
}

/// How the server wants the client to reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reconnect {
    Retry,
    Handshake,
    None,
    #[serde(other)]
    Unknown,
}

/// Negotiated reconnection policy sent by the server on meta replies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advice {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconnect: Option<Reconnect>,
    /// Milliseconds to wait before reconnecting
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<u64>,
    /// Milliseconds the server may hold a connect request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

impl Advice {
    pub fn new(reconnect: Reconnect) -> Self {
        Self {
            reconnect: Some(reconnect),
            ..Default::default()
        }
    }

    pub fn with_interval(mut self, interval_ms: u64) -> Self {
        self.interval = Some(interval_ms);
        self
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout = Some(timeout_ms);
        self
    }

    /// Whether the advice carries a reconnect policy the client understands.
    pub fn is_actionable(&self) -> bool {
        matches!(
            self.reconnect,
            Some(Reconnect::Retry | Reconnect::Handshake | Reconnect::None)
        )
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval.map(Duration::from_millis)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_millis)
    }
}

/// Classification of an outbound message, used for transport routing and
/// exchange timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageClass {
    Handshake,
    Connect,
    Subscribe,
    Unsubscribe,
    Disconnect,
    Publish,
}

impl MessageClass {
    /// Control classes travel over the persistent streaming socket when one is available.
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            MessageClass::Handshake | MessageClass::Connect | MessageClass::Subscribe
        )
    }
}

/// A single Bayeux message envelope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advice: Option<Advice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub successful: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supported_connection_types: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ext: Option<Value>,
    /// Set on replies synthesized locally for a failed exchange
    #[serde(skip)]
    pub failure: Option<TransportError>,
}

impl Message {
    /// An empty message on the given channel.
    pub fn on_channel(channel: impl Into<String>) -> Self {
        Self {
            channel: Some(channel.into()),
            ..Default::default()
        }
    }

    pub fn handshake(id: MessageId, connection_types: &[&str]) -> Self {
        Self {
            id: Some(id),
            version: Some("1.0".to_string()),
            minimum_version: Some("0.9".to_string()),
            supported_connection_types: Some(
                connection_types.iter().map(|t| t.to_string()).collect(),
            ),
            ..Self::on_channel(channel::META_HANDSHAKE)
        }
    }

    pub fn connect(id: MessageId, client_id: &str, connection_type: &str) -> Self {
        Self {
            id: Some(id),
            client_id: Some(client_id.to_string()),
            connection_type: Some(connection_type.to_string()),
            ..Self::on_channel(channel::META_CONNECT)
        }
    }

    pub fn subscribe(id: MessageId, client_id: &str, subscription: &str) -> Self {
        Self {
            id: Some(id),
            client_id: Some(client_id.to_string()),
            subscription: Some(subscription.to_string()),
            ..Self::on_channel(channel::META_SUBSCRIBE)
        }
    }

    pub fn disconnect(id: MessageId, client_id: &str) -> Self {
        Self {
            id: Some(id),
            client_id: Some(client_id.to_string()),
            ..Self::on_channel(channel::META_DISCONNECT)
        }
    }

    pub fn publish(id: MessageId, client_id: &str, channel: &str, data: Value) -> Self {
        Self {
            id: Some(id),
            client_id: Some(client_id.to_string()),
            data: Some(data),
            ..Self::on_channel(channel)
        }
    }

    /// A locally generated unsuccessful reply to `request`.
    pub fn failure_reply(request: &Message, failure: TransportError, advice: Option<Advice>) -> Self {
        Self {
            channel: request.channel.clone(),
            id: request.id.clone(),
            client_id: request.client_id.clone(),
            subscription: request.subscription.clone(),
            successful: Some(false),
            error: Some(failure.to_string()),
            advice,
            failure: Some(failure),
            ..Default::default()
        }
    }

    pub fn channel(&self) -> Option<&str> {
        self.channel.as_deref()
    }

    pub fn is_meta(&self) -> bool {
        self.channel().is_some_and(channel::is_meta)
    }

    pub fn is_successful(&self) -> bool {
        self.successful == Some(true)
    }

    /// Whether the message carries advice the client can act on.
    pub fn has_actionable_advice(&self) -> bool {
        self.advice.as_ref().is_some_and(Advice::is_actionable)
    }

    /// Classify the message by its channel.
    pub fn class(&self) -> MessageClass {
        match self.channel() {
            Some(channel::META_HANDSHAKE) => MessageClass::Handshake,
            Some(channel::META_CONNECT) => MessageClass::Connect,
            Some(channel::META_SUBSCRIBE) => MessageClass::Subscribe,
            Some(channel::META_UNSUBSCRIBE) => MessageClass::Unsubscribe,
            Some(channel::META_DISCONNECT) => MessageClass::Disconnect,
            _ => MessageClass::Publish,
        }
    }
}

/// Decode a JSON value that is either a message array or a single message.
pub fn messages_from_value(value: Value) -> Result<Vec<Message>, serde_json::Error> {
    match value {
        Value::Array(_) => serde_json::from_value(value),
        other => Ok(vec![serde_json::from_value(other)?]),
    }
}
