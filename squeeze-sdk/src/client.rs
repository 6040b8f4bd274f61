//! Sync-first control client
//!
//! All protocol work happens on the background worker; every method here
//! enqueues a command and returns immediately.

use std::sync::{mpsc as std_mpsc, Arc, Mutex, RwLock};
use std::thread::JoinHandle;

use tokio::sync::mpsc;

use squeeze_comet::{AlwaysReachable, ConnectionState, ConnectivityProbe};

use crate::collaborators::{
    ConfigProvider, HttpTransports, NoopShutdown, ShutdownHandler, StaticConfig, TransportBuilder,
};
use crate::config::{ClientConfig, ServerConfig};
use crate::control::PlayerCommand;
use crate::error::{ClientError, Result};
use crate::event::ClientEvent;
use crate::iter::ClientEventIterator;
use crate::worker::{spawn_worker, Command, WorkerParts};

/// Control and status client for one media server
///
/// # Example
///
/// ```rust,ignore
/// use squeeze_sdk::{ClientEvent, CometClient, PlayerCommand, ServerConfig};
///
/// let client = CometClient::new(ServerConfig::new("192.168.1.20"))?;
/// client.connect()?;
/// client.set_player("00:04:20:aa:bb:cc")?;
/// client.publish(PlayerCommand::Play, "00:04:20:aa:bb:cc")?;
///
/// for event in client.iter() {
///     if let ClientEvent::Status(status) = event {
///         println!("{} - {}", status.artist, status.title);
///     }
/// }
/// ```
pub struct CometClient {
    /// Send commands to background worker
    command_tx: mpsc::UnboundedSender<Command>,

    /// Receive events from background worker
    event_rx: Arc<Mutex<std_mpsc::Receiver<ClientEvent>>>,

    /// Last connection state published by the worker
    state: Arc<RwLock<ConnectionState>>,

    worker: Option<JoinHandle<()>>,
}

impl CometClient {
    /// Client for a fixed server with default settings
    pub fn new(server: ServerConfig) -> Result<Self> {
        server.validate()?;
        Self::builder(Arc::new(StaticConfig::new(server))).build()
    }

    /// Configure a client whose server comes from `provider`
    pub fn builder(provider: Arc<dyn ConfigProvider>) -> CometClientBuilder {
        CometClientBuilder::new(provider)
    }

    /// Open a session with the server the provider currently names.
    ///
    /// An open session is replaced.
    pub fn connect(&self) -> Result<()> {
        self.send(Command::Connect)
    }

    /// Close the session and cancel any scheduled reconnection.
    pub fn disconnect(&self) -> Result<()> {
        self.send(Command::Disconnect)
    }

    /// Follow `player`'s status; the previous player is unsubscribed.
    pub fn set_player(&self, player: impl Into<String>) -> Result<()> {
        self.send(Command::SetPlayer(player.into()))
    }

    /// Send `command` to `player`.
    ///
    /// The outcome arrives as [`ClientEvent::CommandResult`]; status
    /// commands also produce a [`ClientEvent::Status`].
    pub fn publish(&self, command: PlayerCommand, player: impl Into<String>) -> Result<()> {
        self.send(Command::Publish {
            command,
            player: player.into(),
        })
    }

    /// Reconnect if the provider's configuration differs from the one the
    /// open session was started with.
    pub fn reconnect_if_changed(&self) -> Result<()> {
        self.send(Command::ReconnectIfChanged)
    }

    /// Last connection state reported by the worker
    pub fn connection_state(&self) -> ConnectionState {
        match self.state.read() {
            Ok(state) => *state,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Blocking iterator over client events
    pub fn iter(&self) -> ClientEventIterator {
        ClientEventIterator::new(Arc::clone(&self.event_rx))
    }

    /// Disconnect and stop the worker, waiting for it to finish.
    pub fn shutdown(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        let _ = self.command_tx.send(Command::Shutdown);
        if worker.join().is_err() {
            tracing::error!("client worker panicked");
        }
    }

    fn send(&self, command: Command) -> Result<()> {
        if self.worker.is_none() {
            return Err(ClientError::WorkerDisconnected);
        }
        self.command_tx
            .send(command)
            .map_err(|_| ClientError::WorkerDisconnected)
    }
}

impl Drop for CometClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Builder for [`CometClient`]
pub struct CometClientBuilder {
    provider: Arc<dyn ConfigProvider>,
    config: ClientConfig,
    probe: Arc<dyn ConnectivityProbe>,
    shutdown: Arc<dyn ShutdownHandler>,
    transports: Arc<dyn TransportBuilder>,
}

impl CometClientBuilder {
    fn new(provider: Arc<dyn ConfigProvider>) -> Self {
        Self {
            provider,
            config: ClientConfig::default(),
            probe: Arc::new(AlwaysReachable),
            shutdown: Arc::new(NoopShutdown),
            transports: Arc::new(HttpTransports),
        }
    }

    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn ConnectivityProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_shutdown_handler(mut self, handler: Arc<dyn ShutdownHandler>) -> Self {
        self.shutdown = handler;
        self
    }

    /// Replace the HTTP transports, e.g. with scripted ones in tests.
    pub fn with_transports(mut self, transports: Arc<dyn TransportBuilder>) -> Self {
        self.transports = transports;
        self
    }

    pub fn build(self) -> Result<CometClient> {
        self.config.validate()?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = std_mpsc::channel();
        let state = Arc::new(RwLock::new(ConnectionState::Disconnected));

        let parts = WorkerParts {
            config: self.config,
            provider: self.provider,
            probe: self.probe,
            shutdown: self.shutdown,
            transports: self.transports,
        };
        let worker = spawn_worker(parts, command_rx, event_tx, Arc::clone(&state))?;

        Ok(CometClient {
            command_tx,
            event_rx: Arc::new(Mutex::new(event_rx)),
            state,
            worker: Some(worker),
        })
    }
}
