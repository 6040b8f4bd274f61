//! Background worker thread owning the session
//!
//! Spawns a thread with its own tokio runtime. The worker is the only place
//! that touches the [`Session`], the player subscription and the server in
//! use; the sync [`CometClient`](crate::CometClient) only enqueues
//! [`Command`]s and reads the events the worker sends back.

use std::collections::VecDeque;
use std::sync::{mpsc as std_mpsc, Arc, RwLock};
use std::thread::{self, JoinHandle};

use serde_json::{json, Value};
use tokio::sync::mpsc;

use squeeze_comet::{
    channel, ConnectionState, ConnectivityProbe, Endpoint, FailureKind, Inbound, Message,
    MessageClass, MessageId, Session, SessionEvent,
};
use squeeze_status::{ArtworkResolver, StatusDecoder};

use crate::collaborators::{ConfigProvider, ShutdownHandler, TransportBuilder};
use crate::config::{ClientConfig, ServerConfig};
use crate::control::{ControlChannel, PlayerCommand};
use crate::error::{ClientError, Result};
use crate::event::ClientEvent;

/// Push interval, in seconds, requested with a player subscription
const STATUS_PUSH_INTERVAL: &str = "subscribe:2";

/// Commands sent from the sync client to the background worker
#[derive(Debug)]
pub(crate) enum Command {
    Connect,
    Disconnect,
    SetPlayer(String),
    Publish { command: PlayerCommand, player: String },
    ReconnectIfChanged,
    Shutdown,
}

/// Everything the worker needs from the host
pub(crate) struct WorkerParts {
    pub config: ClientConfig,
    pub provider: Arc<dyn ConfigProvider>,
    pub probe: Arc<dyn ConnectivityProbe>,
    pub shutdown: Arc<dyn ShutdownHandler>,
    pub transports: Arc<dyn TransportBuilder>,
}

/// Result of a control request, posted back to the worker
struct ControlDone {
    player: String,
    command: PlayerCommand,
    /// Requested by the host rather than by the worker itself
    from_host: bool,
    result: Result<Value>,
}

/// A change to the player status subscription
#[derive(Debug, Clone, PartialEq, Eq)]
enum SubscriptionChange {
    Subscribe(String),
    Unsubscribe(String),
}

impl SubscriptionChange {
    fn player(&self) -> &str {
        match self {
            SubscriptionChange::Subscribe(player) | SubscriptionChange::Unsubscribe(player) => player,
        }
    }

    /// Whether `self` undoes `other`.
    fn cancels(&self, other: &SubscriptionChange) -> bool {
        use SubscriptionChange::*;
        match (self, other) {
            (Subscribe(a), Unsubscribe(b)) | (Unsubscribe(a), Subscribe(b)) => a == b,
            _ => false,
        }
    }
}

/// The server the open session talks to
struct ActiveServer {
    config: ServerConfig,
    control: ControlChannel,
    decoder: StatusDecoder,
}

impl ActiveServer {
    fn new(config: ServerConfig) -> Result<Self> {
        let artwork = ArtworkResolver::new(&config.host, config.port)
            .map_err(|e| ClientError::InvalidConfiguration(e.to_string()))?;
        Ok(Self {
            control: ControlChannel::new(&config),
            decoder: StatusDecoder::new(artwork),
            config,
        })
    }
}

/// Spawns the background worker thread
///
/// The runtime is built before the thread starts so that a failure to
/// create it reaches the caller.
pub(crate) fn spawn_worker(
    parts: WorkerParts,
    command_rx: mpsc::UnboundedReceiver<Command>,
    event_tx: std_mpsc::Sender<ClientEvent>,
    state: Arc<RwLock<ConnectionState>>,
) -> Result<JoinHandle<()>> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(parts.config.worker_threads)
        .thread_name("squeeze-worker")
        .enable_all()
        .build()
        .map_err(|e| ClientError::Runtime(e.to_string()))?;

    thread::Builder::new()
        .name("squeeze-client".to_string())
        .spawn(move || {
            runtime.block_on(async move {
                let (worker, inbound, control_rx) = Worker::new(parts, event_tx, state);
                worker.run(command_rx, inbound, control_rx).await;
            });
        })
        .map_err(|e| ClientError::Runtime(e.to_string()))
}

struct Worker {
    session: Session,
    config: ClientConfig,
    provider: Arc<dyn ConfigProvider>,
    shutdown: Arc<dyn ShutdownHandler>,
    transports: Arc<dyn TransportBuilder>,
    event_tx: std_mpsc::Sender<ClientEvent>,
    state: Arc<RwLock<ConnectionState>>,
    control_tx: mpsc::UnboundedSender<ControlDone>,
    active: Option<ActiveServer>,
    current_player: Option<String>,
    /// Player whose status channel was last subscribed, set when the
    /// subscribe is queued so a quick second switch unsubscribes it
    subscribed_player: Option<String>,
    /// Subscription changes waiting for the one in flight
    outbox: VecDeque<SubscriptionChange>,
    in_flight: Option<(MessageId, SubscriptionChange)>,
    host_gone: bool,
}

impl Worker {
    fn new(
        parts: WorkerParts,
        event_tx: std_mpsc::Sender<ClientEvent>,
        state: Arc<RwLock<ConnectionState>>,
    ) -> (
        Self,
        mpsc::UnboundedReceiver<Inbound>,
        mpsc::UnboundedReceiver<ControlDone>,
    ) {
        let (session, inbound) = Session::new(parts.config.session.clone(), parts.probe);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let worker = Self {
            session,
            config: parts.config,
            provider: parts.provider,
            shutdown: parts.shutdown,
            transports: parts.transports,
            event_tx,
            state,
            control_tx,
            active: None,
            current_player: None,
            subscribed_player: None,
            outbox: VecDeque::new(),
            in_flight: None,
            host_gone: false,
        };
        (worker, inbound, control_rx)
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut inbound: mpsc::UnboundedReceiver<Inbound>,
        mut control_rx: mpsc::UnboundedReceiver<ControlDone>,
    ) {
        tracing::info!("client worker started");

        loop {
            tokio::select! {
                command = commands.recv() => {
                    let command = match command {
                        Some(Command::Shutdown) | None => {
                            tracing::info!("client worker received shutdown");
                            if let Err(e) = self.session.disconnect().await {
                                tracing::debug!(error = %e, "disconnect during shutdown failed");
                            }
                            break;
                        }
                        Some(command) => command,
                    };
                    if let Err(e) = self.on_command(command).await {
                        tracing::warn!(error = %e, "command failed");
                    }
                }
                Some(event) = inbound.recv() => {
                    if let Err(e) = self.session.handle(event).await {
                        tracing::warn!(error = %e, "session event failed");
                    }
                }
                Some(done) = control_rx.recv() => self.on_control_done(done),
            }

            if let Err(e) = self.dispatch_session_events().await {
                tracing::warn!(error = %e, "reacting to session events failed");
            }
            if self.host_gone {
                tracing::debug!("event receiver dropped, shutting down worker");
                break;
            }
        }

        self.publish_state(self.session.state());
        tracing::info!("client worker shut down");
    }

    async fn on_command(&mut self, command: Command) -> Result<()> {
        match command {
            Command::Connect => self.connect().await,
            Command::Disconnect => {
                self.forget_subscriptions();
                self.active = None;
                self.session.disconnect().await?;
                Ok(())
            }
            Command::SetPlayer(player) => {
                tracing::debug!(player = %player, "selecting player");
                self.current_player = Some(player);
                if self.session.state().is_connected() {
                    self.switch_player().await?;
                }
                Ok(())
            }
            Command::Publish { command, player } => {
                self.spawn_control(player, command, true);
                Ok(())
            }
            Command::ReconnectIfChanged => {
                let live = self.provider.server_config();
                let changed = self.active.as_ref().is_some_and(|active| active.config != live);
                if !changed {
                    return Ok(());
                }
                tracing::info!(host = %live.host, port = live.port, "server configuration changed, reconnecting");
                self.session.disconnect().await?;
                self.connect().await
            }
            // Handled by the loop
            Command::Shutdown => Ok(()),
        }
    }

    async fn connect(&mut self) -> Result<()> {
        let server = self.provider.server_config();
        tracing::info!(host = %server.host, port = server.port, "connecting");

        let (endpoint, active) = match self.prepare(server) {
            Ok(prepared) => prepared,
            Err(e) => {
                self.session.fail(FailureKind::InvalidUrl);
                return Err(e);
            }
        };
        let factory = self
            .transports
            .build(endpoint, self.config.session.streaming_enabled);

        self.active = Some(active);
        self.forget_subscriptions();
        if let Err(e) = self.session.connect(factory.as_ref()).await {
            self.session.fail(FailureKind::StartClientError);
            return Err(e.into());
        }
        Ok(())
    }

    fn prepare(&self, server: ServerConfig) -> Result<(Endpoint, ActiveServer)> {
        server.validate()?;
        let endpoint = Endpoint::new(&server.cometd_url(), self.config.session.app_namespace.clone())?
            .with_credentials(server.username.clone(), server.password.clone());
        Ok((endpoint, ActiveServer::new(server)?))
    }

    fn forget_subscriptions(&mut self) {
        self.subscribed_player = None;
        self.outbox.clear();
        self.in_flight = None;
    }

    /// React to everything the session produced, including events caused by
    /// the reactions themselves.
    async fn dispatch_session_events(&mut self) -> Result<()> {
        loop {
            let events = self.session.take_events();
            if events.is_empty() {
                return Ok(());
            }
            for event in events {
                self.on_session_event(event).await?;
            }
        }
    }

    async fn on_session_event(&mut self, event: SessionEvent) -> Result<()> {
        match event {
            SessionEvent::StateChanged(state) => {
                if !state.is_connected() {
                    self.forget_subscriptions();
                }
                self.publish_state(state);
                self.emit(ClientEvent::ConnectionState(state));
            }
            SessionEvent::Established { client_id } => {
                self.forget_subscriptions();
                let broadcast = channel::player_status_broadcast(&client_id, self.namespace());
                self.session.subscribe(&broadcast).await?;
                self.switch_player().await?;
            }
            SessionEvent::Reply { request, reply } => self.on_reply(request, reply).await?,
            SessionEvent::Push(message) => self.on_push(message),
            SessionEvent::Fatal => {
                if self.shutdown.surfaces_active() {
                    tracing::warn!("session failed for good while a surface is active");
                } else {
                    tracing::error!("session failed for good, requesting shutdown");
                    self.shutdown.request_shutdown();
                }
            }
        }
        Ok(())
    }

    fn namespace(&self) -> &str {
        &self.config.session.app_namespace
    }

    /// Move the player subscription to the current player.
    async fn switch_player(&mut self) -> Result<()> {
        if self.session.client_id().is_none() || self.subscribed_player == self.current_player {
            return Ok(());
        }

        if let Some(previous) = self.subscribed_player.take() {
            self.queue(SubscriptionChange::Unsubscribe(previous));
        }
        if let Some(player) = self.current_player.clone() {
            self.subscribed_player = Some(player.clone());
            self.queue(SubscriptionChange::Subscribe(player));
        }
        self.send_next_change().await
    }

    /// Queue `change`, cancelling a not yet sent opposite change for the
    /// same player instead.
    fn queue(&mut self, change: SubscriptionChange) {
        let opposite = self.outbox.iter().position(|queued| change.cancels(queued));
        match opposite {
            Some(index) => {
                tracing::debug!(?change, "cancelling queued subscription change");
                self.outbox.remove(index);
            }
            None => self.outbox.push_back(change),
        }
    }

    /// Publish the next subscription change unless one is in flight.
    ///
    /// Publishes travel as independent requests that may overtake each
    /// other, so changes go out one at a time.
    async fn send_next_change(&mut self) -> Result<()> {
        if self.in_flight.is_some() {
            return Ok(());
        }
        let Some(client_id) = self.session.client_id().map(str::to_string) else {
            return Ok(());
        };
        let Some(change) = self.outbox.pop_front() else {
            return Ok(());
        };

        let namespace = self.namespace().to_string();
        let response = channel::player_status(&client_id, &namespace, change.player());
        let (target, data) = match &change {
            SubscriptionChange::Subscribe(player) => {
                let mut words = PlayerCommand::Status.words();
                words.push(STATUS_PUSH_INTERVAL.to_string());
                tracing::debug!(player = %player, channel = %response, "subscribing player status");
                (
                    channel::app_subscribe(&namespace),
                    json!({ "request": [player, words], "response": response }),
                )
            }
            SubscriptionChange::Unsubscribe(player) => {
                tracing::debug!(player = %player, "unsubscribing player status");
                (
                    channel::app_unsubscribe(&namespace),
                    json!({ "unsubscribe": response }),
                )
            }
        };

        let id = self.session.publish(&target, data).await?;
        self.in_flight = Some((id, change));
        Ok(())
    }

    async fn on_reply(&mut self, request: Message, reply: Message) -> Result<()> {
        let answers_change = matches!(
            (&self.in_flight, &request.id),
            (Some((id, _)), Some(request_id)) if id == request_id
        );
        let in_flight = if answers_change { self.in_flight.take() } else { None };

        let Some((_, change)) = in_flight else {
            if !reply.is_successful() {
                tracing::warn!(
                    channel = ?request.channel,
                    error = ?reply.error,
                    failure = ?reply.failure,
                    "request failed"
                );
            } else if request.class() == MessageClass::Subscribe {
                tracing::debug!(subscription = ?request.subscription, "subscribed");
            }
            return Ok(());
        };

        match change {
            SubscriptionChange::Subscribe(player) if !reply.is_successful() => {
                tracing::warn!(player = %player, error = ?reply.error, "player subscription failed");
                if self.subscribed_player.as_deref() == Some(player.as_str()) {
                    self.subscribed_player = None;
                }
            }
            SubscriptionChange::Subscribe(player) => {
                if self.current_player.as_deref() == Some(player.as_str()) {
                    self.spawn_control(player, PlayerCommand::Status, false);
                } else {
                    tracing::debug!(player = %player, "subscription completed for a player no longer selected");
                }
            }
            SubscriptionChange::Unsubscribe(player) if !reply.is_successful() => {
                tracing::warn!(player = %player, error = ?reply.error, "player unsubscribe failed");
            }
            SubscriptionChange::Unsubscribe(_) => {}
        }
        self.send_next_change().await
    }

    fn on_push(&mut self, message: Message) {
        let Some(channel) = message.channel.as_deref() else {
            return;
        };
        let Some(player) = channel::player_from_status_channel(channel, self.namespace()) else {
            tracing::trace!(channel, "ignoring push");
            return;
        };
        match message.data.as_ref() {
            Some(data) => self.emit_status(player, data),
            None => tracing::debug!(channel, "status push without data"),
        }
    }

    fn emit_status(&mut self, player: &str, payload: &Value) {
        let decoded = match &self.active {
            Some(active) => active.decoder.decode(player, payload),
            None => {
                let server = self.provider.server_config();
                match ArtworkResolver::new(&server.host, server.port) {
                    Ok(artwork) => StatusDecoder::new(artwork).decode(player, payload),
                    Err(e) => {
                        tracing::warn!(error = %e, "cannot decode status without a valid server");
                        return;
                    }
                }
            }
        };
        match decoded {
            Ok(status) => self.emit(ClientEvent::Status(status)),
            Err(e) => tracing::warn!(player, error = %e, "could not decode player status"),
        }
    }

    fn spawn_control(&self, player: String, command: PlayerCommand, from_host: bool) {
        let control = match &self.active {
            Some(active) => active.control.clone(),
            None => ControlChannel::new(&self.provider.server_config()),
        };
        let tx = self.control_tx.clone();
        tokio::spawn(async move {
            let result = control.request(&player, &command).await;
            let _ = tx.send(ControlDone {
                player,
                command,
                from_host,
                result,
            });
        });
    }

    fn on_control_done(&mut self, done: ControlDone) {
        let ControlDone {
            player,
            command,
            from_host,
            result,
        } = done;

        match &result {
            Ok(value) if command.is_status() => self.emit_status(&player, value),
            Ok(_) => tracing::debug!(player = %player, %command, "command completed"),
            Err(e) => tracing::warn!(player = %player, %command, error = %e, "command failed"),
        }

        if from_host {
            self.emit(ClientEvent::CommandResult {
                player,
                command,
                result: result.map_err(|e| e.to_string()),
            });
        }
    }

    fn publish_state(&self, state: ConnectionState) {
        match self.state.write() {
            Ok(mut current) => *current = state,
            Err(poisoned) => *poisoned.into_inner() = state,
        }
    }

    fn emit(&mut self, event: ClientEvent) {
        if self.event_tx.send(event).is_err() {
            self.host_gone = true;
        }
    }
}
