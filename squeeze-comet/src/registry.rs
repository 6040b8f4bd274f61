//! Correlation of outbound messages with their replies.
//!
//! Every message a transport sends is registered as an [`Exchange`] keyed by
//! its message id, together with an expiry task. An exchange leaves the
//! registry exactly once: when its reply arrives, when it is cancelled, or
//! when it expires. Dropping an exchange always cancels its expiry task.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio::task::AbortHandle;

use crate::error::{CometError, Result, TransportError};
use crate::link::TransportLink;
use crate::message::{Advice, Message, MessageClass, MessageId};

/// Timeout for an exchange of the given class.
///
/// Connect requests may be held by the server for the advised timeout, so they
/// get that on top of the base network delay.
pub fn exchange_timeout(class: MessageClass, base: Duration, advice: Option<&Advice>) -> Duration {
    match class {
        MessageClass::Connect => base + advice.and_then(Advice::timeout).unwrap_or_default(),
        _ => base,
    }
}

/// Base delay plus the last advice seen for the long-poll channel.
#[derive(Debug, Clone, Default)]
pub struct ExchangeTimeouts {
    pub base_network_delay: Duration,
    pub advice: Option<Advice>,
}

impl ExchangeTimeouts {
    pub fn new(base_network_delay: Duration, advice: Option<Advice>) -> Self {
        Self {
            base_network_delay,
            advice,
        }
    }

    pub fn for_message(&self, message: &Message) -> Duration {
        exchange_timeout(message.class(), self.base_network_delay, self.advice.as_ref())
    }
}

/// A reply (real or synthesized) matched to its request, or an unsolicited push.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Reply { request: Message, reply: Message },
    Push(Message),
}

/// Result of looking up outstanding exchanges by channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMatch {
    None,
    Unique(MessageId),
    Ambiguous(usize),
}

/// A pending outbound message.
#[derive(Debug)]
pub struct Exchange {
    message: Message,
    expiry: Option<AbortHandle>,
}

impl Exchange {
    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn channel(&self) -> Option<&str> {
        self.message.channel()
    }

    /// Consume the exchange, cancelling its expiry task.
    pub fn into_message(mut self) -> Message {
        self.cancel_expiry();
        std::mem::take(&mut self.message)
    }

    fn cancel_expiry(&mut self) {
        if let Some(expiry) = self.expiry.take() {
            expiry.abort();
        }
    }
}

impl Drop for Exchange {
    fn drop(&mut self) {
        self.cancel_expiry();
    }
}

/// Registry of the exchanges a single transport has in flight.
#[derive(Debug)]
pub struct ExchangeRegistry {
    exchanges: HashMap<MessageId, Exchange>,
    link: TransportLink,
}

impl ExchangeRegistry {
    pub fn new(link: TransportLink) -> Self {
        Self {
            exchanges: HashMap::new(),
            link,
        }
    }

    /// Register `message` and arm its expiry task.
    ///
    /// When the task fires, the link reports the id as expired; the owner then
    /// calls [`expire`](Self::expire). Registering an id that is still live is
    /// an invariant violation and is rejected.
    pub fn register(&mut self, message: Message, timeout: Duration) -> Result<&Exchange> {
        let id = message.id.clone().ok_or(CometError::MissingMessageId)?;
        if self.exchanges.contains_key(&id) {
            return Err(CometError::DuplicateExchange(id));
        }

        let link = self.link.clone();
        let expired_id = id.clone();
        let expiry = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            link.expired(expired_id);
        })
        .abort_handle();

        let exchange = Exchange {
            message,
            expiry: Some(expiry),
        };
        let exchange = self.exchanges.entry(id).or_insert(exchange);
        Ok(&*exchange)
    }

    /// Register every message of `batch`, or none of them when any id is
    /// missing, already live, or repeated within the batch.
    pub fn register_batch(&mut self, batch: &[Message], timeouts: &ExchangeTimeouts) -> Result<()> {
        let mut ids = HashSet::with_capacity(batch.len());
        for message in batch {
            let id = message.id.as_ref().ok_or(CometError::MissingMessageId)?;
            if self.exchanges.contains_key(id) || !ids.insert(id) {
                return Err(CometError::DuplicateExchange(id.clone()));
            }
        }

        for message in batch {
            self.register(message.clone(), timeouts.for_message(message))?;
        }
        Ok(())
    }

    /// Remove the exchange for `id`, cancelling its expiry task.
    pub fn resolve(&mut self, id: &MessageId) -> Option<Exchange> {
        let mut exchange = self.exchanges.remove(id)?;
        exchange.cancel_expiry();
        Some(exchange)
    }

    /// Remove an expired exchange and synthesize its timeout reply.
    pub fn expire(&mut self, id: &MessageId) -> Option<Delivery> {
        self.resolve(id)
            .map(|exchange| failed(exchange, &TransportError::Timeout))
    }

    /// Fail one exchange with `cause`, if it is still live.
    pub fn fail(&mut self, id: &MessageId, cause: &TransportError) -> Option<Delivery> {
        self.resolve(id).map(|exchange| failed(exchange, cause))
    }

    /// Drain every live exchange, failing each with `cause` exactly once.
    pub fn fail_all(&mut self, cause: &TransportError) -> Vec<Delivery> {
        let mut ids: Vec<MessageId> = self.exchanges.keys().cloned().collect();
        ids.sort();
        ids.iter()
            .filter_map(|id| self.fail(id, cause))
            .collect()
    }

    /// Find the outstanding exchange whose outbound channel is `channel`.
    pub fn match_channel(&self, channel: &str) -> ChannelMatch {
        let mut matches = self
            .exchanges
            .iter()
            .filter(|(_, exchange)| exchange.channel() == Some(channel))
            .map(|(id, _)| id);

        match (matches.next(), matches.next()) {
            (None, _) => ChannelMatch::None,
            (Some(id), None) => ChannelMatch::Unique(id.clone()),
            (Some(_), Some(_)) => ChannelMatch::Ambiguous(2 + matches.count()),
        }
    }

    /// Find the single live exchange of one of the given classes.
    pub fn match_class(&self, classes: &[MessageClass]) -> ChannelMatch {
        let mut matches = self
            .exchanges
            .iter()
            .filter(|(_, exchange)| classes.contains(&exchange.message.class()))
            .map(|(id, _)| id);

        match (matches.next(), matches.next()) {
            (None, _) => ChannelMatch::None,
            (Some(id), None) => ChannelMatch::Unique(id.clone()),
            (Some(_), Some(_)) => ChannelMatch::Ambiguous(2 + matches.count()),
        }
    }

    /// Match an inbound message against the live exchanges.
    ///
    /// A message whose id belongs to a live exchange on the same channel is
    /// that exchange's reply. If the id matches but the channel does not, the
    /// server reused a request id on a push; the id is cleared and the message
    /// is delivered as a push. Meta messages that match nothing are dropped.
    pub fn correlate(&mut self, mut message: Message) -> Option<Delivery> {
        if let Some(id) = message.id.clone() {
            let same_channel = self.exchanges.get(&id).map(|exchange| {
                message.channel.is_none() || message.channel() == exchange.channel()
            });

            match same_channel {
                Some(true) => {
                    let request = self.resolve(&id)?.into_message();
                    if message.channel.is_none() {
                        message.channel = request.channel.clone();
                    }
                    return Some(Delivery::Reply {
                        request,
                        reply: message,
                    });
                }
                Some(false) => {
                    tracing::trace!(%id, channel = ?message.channel, "id reused on push, clearing");
                    message.id = None;
                }
                None => {}
            }
        }

        if message.is_meta() || message.channel.is_none() {
            tracing::debug!(
                channel = ?message.channel,
                id = ?message.id,
                "dropping message with no matching exchange"
            );
            return None;
        }

        Some(Delivery::Push(message))
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.exchanges.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.exchanges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty()
    }
}

fn failed(exchange: Exchange, cause: &TransportError) -> Delivery {
    let request = exchange.into_message();
    let reply = Message::failure_reply(&request, cause.clone(), None);
    Delivery::Reply { request, reply }
}
