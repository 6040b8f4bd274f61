//! Bayeux session: handshake, long-poll and advice-driven reconnection.
//!
//! A [`Session`] is owned by a single task. Everything that happens off that
//! task (HTTP completions, the socket reader, timers) arrives as an
//! [`Inbound`] event on the receiver returned by [`Session::new`], and the owner
//! feeds it back through [`Session::handle`]. After every call the owner drains
//! [`Session::take_events`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::config::SessionConfig;
use crate::error::{CometError, Result, TransportError};
use crate::link::{Inbound, ReconnectAction, TransportKind, TransportLink};
use crate::message::{channel, Advice, Message, MessageClass, MessageId, Reconnect};
use crate::registry::{Delivery, ExchangeTimeouts};
use crate::state::{ConnectionState, ConnectionTracker, FailureKind};
use crate::transport::{Transport, TransportFactory};

/// Reports whether the host currently has network connectivity.
pub trait ConnectivityProbe: Send + Sync {
    fn is_network_reachable(&self) -> bool;
}

/// Probe that always reports the network as reachable.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysReachable;

impl ConnectivityProbe for AlwaysReachable {
    fn is_network_reachable(&self) -> bool {
        true
    }
}

/// Something the session owner needs to react to.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(ConnectionState),
    /// A handshake succeeded; subscriptions must be (re)established
    Established { client_id: String },
    /// Reply (real or synthesized) to a subscribe or publish
    Reply { request: Message, reply: Message },
    /// Unsolicited message on an application channel
    Push(Message),
    /// Handshakes keep failing although the network is up
    Fatal,
}

enum Pending {
    Deliver(TransportKind, Delivery),
    ConnectionLost(TransportError),
}

/// Client side of a Bayeux session.
pub struct Session {
    config: SessionConfig,
    tracker: ConnectionTracker,
    probe: Arc<dyn ConnectivityProbe>,
    tx: mpsc::UnboundedSender<Inbound>,
    generation: u64,
    request: Option<Box<dyn Transport>>,
    streaming: Option<Box<dyn Transport>>,
    client_id: Option<String>,
    next_id: u64,
    handshake_failures: u32,
    connect_advice: Option<Advice>,
    handshake_timer: Option<AbortHandle>,
    reconnect_timer: Option<AbortHandle>,
    backlog: VecDeque<Pending>,
    events: Vec<SessionEvent>,
}

impl Session {
    pub fn new(
        config: SessionConfig,
        probe: Arc<dyn ConnectivityProbe>,
    ) -> (Self, mpsc::UnboundedReceiver<Inbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let tracker = ConnectionTracker::with_window(config.rehandshake_window);
        let session = Self {
            config,
            tracker,
            probe,
            tx,
            generation: 0,
            request: None,
            streaming: None,
            client_id: None,
            next_id: 1,
            handshake_failures: 0,
            connect_advice: None,
            handshake_timer: None,
            reconnect_timer: None,
            backlog: VecDeque::new(),
            events: Vec::new(),
        };
        (session, rx)
    }

    pub fn state(&self) -> ConnectionState {
        self.tracker.state()
    }

    pub fn failure(&self) -> Option<FailureKind> {
        self.tracker.failure()
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn handshake_failures(&self) -> u32 {
        self.handshake_failures
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Last advice seen with a timeout, used for connect exchange timeouts.
    pub fn connect_advice(&self) -> Option<&Advice> {
        self.connect_advice.as_ref()
    }

    /// Exchanges still waiting for a reply across both transports.
    pub fn pending(&self) -> usize {
        self.request.as_ref().map_or(0, |t| t.pending()) + self.streaming.as_ref().map_or(0, |t| t.pending())
    }

    /// Drain the events produced since the last call.
    pub fn take_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    /// Start a new connection cycle with fresh transports and send a handshake.
    ///
    /// Any previous cycle is aborted; its events are ignored from here on.
    pub async fn connect(&mut self, factory: &dyn TransportFactory) -> Result<()> {
        self.stop();
        self.generation += 1;

        let request = factory
            .create(
                TransportKind::Request,
                TransportLink::new(self.generation, TransportKind::Request, self.tx.clone()),
            )
            .ok_or(CometError::NoTransport)?;
        self.request = Some(request);
        self.streaming = if self.config.streaming_enabled {
            factory.create(
                TransportKind::Streaming,
                TransportLink::new(self.generation, TransportKind::Streaming, self.tx.clone()),
            )
        } else {
            None
        };

        tracing::info!(
            generation = self.generation,
            streaming = self.streaming.is_some(),
            "starting session"
        );

        self.handshake_failures = 0;
        self.connect_advice = None;
        self.set_state(ConnectionState::ConnectionStarted);
        self.send_handshake().await?;
        self.drain().await
    }

    /// Leave the session on request of the user.
    ///
    /// Scheduled reconnections are cancelled and the server is told about it
    /// if a session was established.
    pub async fn disconnect(&mut self) -> Result<()> {
        self.cancel_timers();
        if let Some(streaming) = self.streaming.as_mut() {
            let aborted = streaming.abort();
            self.enqueue(TransportKind::Streaming, aborted);
        }

        if let Some(client_id) = self.client_id.take() {
            let message = Message::disconnect(self.next_message_id(), &client_id);
            if let Err(e) = self.send(message).await {
                tracing::debug!(error = %e, "could not send disconnect");
            }
        }

        self.set_state(ConnectionState::ManualDisconnect);
        self.drain().await
    }

    /// Give up on the session because it could not be set up.
    pub fn fail(&mut self, kind: FailureKind) {
        tracing::error!(?kind, "session failed");
        self.stop();
        self.set_error(kind);
    }

    /// Subscribe to `subscription` through `/meta/subscribe`.
    pub async fn subscribe(&mut self, subscription: &str) -> Result<MessageId> {
        let client_id = self.client_id.clone().ok_or(CometError::NotConnected)?;
        let id = self.next_message_id();
        self.send(Message::subscribe(id.clone(), &client_id, subscription))
            .await?;
        self.drain().await?;
        Ok(id)
    }

    /// Publish `data` on an application channel.
    pub async fn publish(&mut self, channel: &str, data: Value) -> Result<MessageId> {
        let client_id = self.client_id.clone().ok_or(CometError::NotConnected)?;
        let id = self.next_message_id();
        self.send(Message::publish(id.clone(), &client_id, channel, data))
            .await?;
        self.drain().await?;
        Ok(id)
    }

    /// Apply an event from the session queue.
    pub async fn handle(&mut self, inbound: Inbound) -> Result<()> {
        if inbound.generation() != self.generation {
            tracing::trace!(
                event_generation = inbound.generation(),
                generation = self.generation,
                "ignoring event from an earlier connection"
            );
            return Ok(());
        }

        match inbound {
            Inbound::Received {
                transport, batch, ..
            } => {
                let deliveries = self.transport_mut(transport)?.on_received(batch);
                self.enqueue(transport, deliveries);
            }
            Inbound::Failed {
                transport,
                error,
                batch,
                ..
            } => {
                // The socket is gone even when no exchange was open on it
                let socket_lost = (transport == TransportKind::Streaming
                    && error != TransportError::Aborted)
                    .then(|| error.clone());
                let deliveries = self.transport_mut(transport)?.on_failed(error, batch);
                self.queue(transport, deliveries, socket_lost);
            }
            Inbound::Expired { transport, id, .. } => {
                let deliveries = self.transport_mut(transport)?.on_expired(&id);
                self.enqueue(transport, deliveries);
            }
            Inbound::HandshakeTimeout { .. } => self.on_handshake_timeout().await?,
            Inbound::Reconnect { action, .. } => self.on_reconnect(action).await?,
        }

        self.drain().await
    }

    fn next_message_id(&mut self) -> MessageId {
        let id = MessageId::from(self.next_id);
        self.next_id += 1;
        id
    }

    fn route(&self, class: MessageClass) -> TransportKind {
        if class.is_control() && self.streaming.is_some() {
            TransportKind::Streaming
        } else {
            TransportKind::Request
        }
    }

    fn transport_mut(&mut self, kind: TransportKind) -> Result<&mut (dyn Transport + 'static)> {
        let transport = match kind {
            TransportKind::Request => self.request.as_deref_mut(),
            TransportKind::Streaming => self.streaming.as_deref_mut(),
        };
        transport.ok_or(CometError::NoTransport)
    }

    async fn send(&mut self, message: Message) -> Result<()> {
        let kind = self.route(message.class());
        let timeouts = ExchangeTimeouts::new(self.config.base_network_delay, self.connect_advice.clone());
        tracing::debug!(transport = %kind, channel = ?message.channel, id = ?message.id, "sending");

        let deliveries = self.transport_mut(kind)?.send(vec![message], &timeouts).await?;
        self.enqueue(kind, deliveries);
        Ok(())
    }

    /// Queue deliveries for [`drain`](Self::drain).
    ///
    /// Any failure other than an abort on the streaming transport means the
    /// socket went down and took every open exchange with it. The handshake
    /// and connect replies of such a batch are replaced by one synthesized
    /// handshake failure that sends the session into a rehandshake.
    fn enqueue(&mut self, kind: TransportKind, deliveries: Vec<Delivery>) {
        self.queue(kind, deliveries, None);
    }

    /// As [`enqueue`](Self::enqueue); `socket_lost` forces the rehandshake
    /// for a socket that failed with no exchange open on it.
    fn queue(&mut self, kind: TransportKind, deliveries: Vec<Delivery>, socket_lost: Option<TransportError>) {
        let lost = socket_lost.or_else(|| match kind {
            TransportKind::Streaming => deliveries.iter().find_map(|delivery| match delivery {
                Delivery::Reply { reply, .. } => reply
                    .failure
                    .clone()
                    .filter(|failure| *failure != TransportError::Aborted),
                Delivery::Push(_) => None,
            }),
            TransportKind::Request => None,
        });

        for delivery in deliveries {
            if lost.is_some() {
                if let Delivery::Reply { request, .. } = &delivery {
                    if matches!(request.class(), MessageClass::Handshake | MessageClass::Connect) {
                        continue;
                    }
                }
            }
            self.backlog.push_back(Pending::Deliver(kind, delivery));
        }

        if let Some(error) = lost {
            self.backlog.push_back(Pending::ConnectionLost(error));
        }
    }

    async fn drain(&mut self) -> Result<()> {
        while let Some(pending) = self.backlog.pop_front() {
            match pending {
                Pending::Deliver(_, Delivery::Push(message)) => {
                    self.events.push(SessionEvent::Push(message));
                }
                Pending::Deliver(_, Delivery::Reply { request, reply }) => match request.class() {
                    MessageClass::Handshake => self.on_handshake_reply(reply).await?,
                    MessageClass::Connect => self.on_connect_reply(reply).await?,
                    MessageClass::Disconnect => {
                        tracing::debug!(successful = reply.is_successful(), "disconnect acknowledged");
                    }
                    _ => self.events.push(SessionEvent::Reply { request, reply }),
                },
                Pending::ConnectionLost(error) => self.on_connection_lost(error).await?,
            }
        }
        Ok(())
    }

    fn remember_advice(&mut self, advice: Option<&Advice>) {
        if let Some(advice) = advice.filter(|a| a.timeout.is_some()) {
            self.connect_advice = Some(advice.clone());
        }
    }

    async fn send_handshake(&mut self) -> Result<()> {
        let connection_types: &[&str] = if self.streaming.is_some() {
            &["streaming", "long-polling"]
        } else {
            &["long-polling"]
        };
        let message = Message::handshake(self.next_message_id(), connection_types);
        self.arm_handshake_timer();
        self.send(message).await
    }

    async fn send_connect(&mut self) -> Result<()> {
        let client_id = self.client_id.clone().ok_or(CometError::NotConnected)?;
        let connection_type = if self.streaming.is_some() {
            "streaming"
        } else {
            "long-polling"
        };
        let message = Message::connect(self.next_message_id(), &client_id, connection_type);
        self.send(message).await
    }

    async fn on_handshake_reply(&mut self, reply: Message) -> Result<()> {
        if self.tracker.state() == ConnectionState::ManualDisconnect
            || reply.failure == Some(TransportError::Aborted)
        {
            tracing::trace!("ignoring handshake reply");
            return Ok(());
        }
        // The timer guards a single handshake exchange, not the connection
        // cycle. Left armed through a retry backoff longer than the timeout,
        // it would count the same failure twice.
        if let Some(timer) = self.handshake_timer.take() {
            timer.abort();
        }
        self.remember_advice(reply.advice.as_ref());

        match reply.client_id.clone().filter(|_| reply.is_successful()) {
            Some(client_id) => self.on_handshake_success(client_id).await,
            None => {
                self.on_handshake_failure(reply);
                Ok(())
            }
        }
    }

    async fn on_handshake_success(&mut self, client_id: String) -> Result<()> {
        self.handshake_failures = 0;
        self.client_id = Some(client_id.clone());
        self.set_state(ConnectionState::ConnectionCompleted);

        tracing::info!(client_id = %client_id, "handshake succeeded");
        self.events.push(SessionEvent::Established { client_id });
        self.send_connect().await
    }

    fn on_handshake_failure(&mut self, reply: Message) {
        self.handshake_failures += 1;
        let failures = self.handshake_failures;
        tracing::warn!(failures, error = ?reply.error, "handshake failed");
        self.client_id = None;

        if reply.failure == Some(TransportError::Status(401)) {
            tracing::error!("server rejected the credentials");
            self.stop();
            self.set_error(FailureKind::LoginFailed);
            return;
        }

        if failures >= self.config.max_handshake_failures && self.probe.is_network_reachable() {
            tracing::error!(failures, "giving up after repeated handshake failures");
            self.stop();
            self.set_error(FailureKind::ConnectionError);
            self.events.push(SessionEvent::Fatal);
            return;
        }

        self.set_state(ConnectionState::Rehandshaking);
        if !self.tracker.can_rehandshake() {
            tracing::warn!("rehandshake window elapsed");
            self.stop();
            self.set_error(FailureKind::ConnectionError);
            return;
        }

        let advice = reply.advice.unwrap_or_default();
        match advice.reconnect {
            Some(Reconnect::None) => {
                tracing::info!("server advised not to reconnect");
                self.stop();
                self.set_state(ConnectionState::Disconnected);
            }
            _ => {
                let delay = advice
                    .interval()
                    .unwrap_or_else(|| self.config.backoff(failures));
                self.schedule(ReconnectAction::Handshake, delay);
            }
        }
    }

    async fn on_connect_reply(&mut self, reply: Message) -> Result<()> {
        if !self.tracker.is_connected() || reply.failure == Some(TransportError::Aborted) {
            tracing::trace!("ignoring connect reply");
            return Ok(());
        }
        self.remember_advice(reply.advice.as_ref());
        let successful = reply.is_successful();

        if let Some(error) = reply.failure {
            return self.on_connection_lost(error).await;
        }

        let advice = reply.advice.filter(Advice::is_actionable);
        let interval = advice.as_ref().and_then(Advice::interval);

        if successful {
            self.schedule(ReconnectAction::Connect, interval.unwrap_or_default());
            return Ok(());
        }

        match advice.and_then(|a| a.reconnect) {
            Some(Reconnect::Retry) => {
                let delay = interval.unwrap_or_else(|| self.config.backoff(1));
                self.schedule(ReconnectAction::Connect, delay);
            }
            Some(Reconnect::Handshake) => {
                tracing::info!("server asked for a new handshake");
                self.client_id = None;
                self.set_state(ConnectionState::Rehandshaking);
                self.schedule(ReconnectAction::Handshake, interval.unwrap_or_default());
            }
            _ => {
                tracing::warn!(error = ?reply.error, "connect rejected without usable advice, disconnecting");
                self.stop();
                self.set_state(ConnectionState::Disconnected);
            }
        }
        Ok(())
    }

    /// Treat a lost connection as a failed handshake advising a new one.
    async fn on_connection_lost(&mut self, error: TransportError) -> Result<()> {
        if !matches!(
            self.tracker.state(),
            ConnectionState::ConnectionStarted
                | ConnectionState::ConnectionCompleted
                | ConnectionState::Rehandshaking
        ) {
            return Ok(());
        }

        tracing::warn!(%error, "connection lost");
        let request = Message::on_channel(channel::META_HANDSHAKE);
        let reply = Message::failure_reply(&request, error, Some(Advice::new(Reconnect::Handshake)));
        self.on_handshake_reply(reply).await
    }

    async fn on_handshake_timeout(&mut self) -> Result<()> {
        if self.client_id.is_some() || !self.tracker.is_connect_in_progress() {
            return Ok(());
        }

        tracing::warn!(timeout = ?self.config.handshake_timeout, "handshake timed out");
        self.abort_transports();
        let request = Message::on_channel(channel::META_HANDSHAKE);
        let reply = Message::failure_reply(&request, TransportError::Timeout, None);
        self.on_handshake_reply(reply).await
    }

    async fn on_reconnect(&mut self, action: ReconnectAction) -> Result<()> {
        self.reconnect_timer = None;
        match action {
            ReconnectAction::Handshake if self.tracker.is_rehandshaking() => {
                tracing::debug!("rehandshaking");
                self.send_handshake().await
            }
            ReconnectAction::Connect if self.tracker.is_connected() => self.send_connect().await,
            _ => {
                tracing::debug!(?action, state = %self.tracker.state(), "dropping stale reconnect");
                Ok(())
            }
        }
    }

    fn arm_handshake_timer(&mut self) {
        if let Some(timer) = self.handshake_timer.take() {
            timer.abort();
        }
        let tx = self.tx.clone();
        let generation = self.generation;
        let timeout = self.config.handshake_timeout;
        self.handshake_timer = Some(
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let _ = tx.send(Inbound::HandshakeTimeout { generation });
            })
            .abort_handle(),
        );
    }

    fn schedule(&mut self, action: ReconnectAction, delay: Duration) {
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
        tracing::debug!(?action, ?delay, "scheduling reconnect");

        let tx = self.tx.clone();
        let generation = self.generation;
        self.reconnect_timer = Some(
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(Inbound::Reconnect { generation, action });
            })
            .abort_handle(),
        );
    }

    fn cancel_timers(&mut self) {
        for timer in [self.handshake_timer.take(), self.reconnect_timer.take()]
            .into_iter()
            .flatten()
        {
            timer.abort();
        }
    }

    fn abort_transports(&mut self) {
        if let Some(transport) = self.request.as_mut() {
            let aborted = transport.abort();
            self.enqueue(TransportKind::Request, aborted);
        }
        if let Some(transport) = self.streaming.as_mut() {
            let aborted = transport.abort();
            self.enqueue(TransportKind::Streaming, aborted);
        }
    }

    /// Cancel timers, abort both transports and forget the client id.
    fn stop(&mut self) {
        self.cancel_timers();
        self.abort_transports();
        self.client_id = None;
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.tracker.set_state(state) {
            self.events.push(SessionEvent::StateChanged(state));
        }
    }

    fn set_error(&mut self, kind: FailureKind) {
        if self.tracker.set_error(kind) {
            self.events
                .push(SessionEvent::StateChanged(ConnectionState::ConnectionFailed));
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel_timers();
    }
}
