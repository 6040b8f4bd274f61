//! # squeeze-sdk
//!
//! A sync-first client for the real-time control and status channel of a
//! Lyrion/Squeezebox media server.
//!
//! [`CometClient`] keeps a Bayeux session with the server on a background
//! worker thread, follows one player's status and sends player commands.
//! Nothing in the public API is async: methods enqueue work and return, and
//! results arrive on a blocking [`ClientEventIterator`].
//!
//! ## Usage
//!
//! ```rust,ignore
//! use squeeze_sdk::{ClientEvent, CometClient, PlayerCommand, ServerConfig};
//!
//! squeeze_sdk::logging::init_logging_from_env()?;
//!
//! let client = CometClient::new(ServerConfig::new("192.168.1.20"))?;
//! client.connect()?;
//! client.set_player("00:04:20:aa:bb:cc")?;
//!
//! for event in client.iter() {
//!     match event {
//!         ClientEvent::Status(status) => println!("{} {}ms", status.title, status.position_ms),
//!         ClientEvent::ConnectionState(state) => println!("connection: {}", state),
//!         ClientEvent::CommandResult { command, result, .. } => println!("{}: {:?}", command, result),
//!     }
//! }
//! ```
//!
//! ## Architecture
//!
//! 1. **Client**: [`CometClient`] turns calls into commands on an ordered queue
//! 2. **Worker**: one task owns the [`Session`](squeeze_comet::Session), applies
//!    commands and transport events in order, and manages the player
//!    subscription
//! 3. **Control**: player commands are JSON-RPC requests on a
//!    [`ControlChannel`]; status results go through the status decoder
//! 4. **Events**: status snapshots and connection changes are delivered on the
//!    [`ClientEventIterator`]

pub mod client;
pub mod collaborators;
pub mod config;
pub mod control;
pub mod error;
pub mod event;
pub mod iter;
mod worker;

pub use client::{CometClient, CometClientBuilder};
pub use collaborators::{
    AlwaysReachable, ConfigProvider, ConnectivityProbe, HttpTransports, NoopShutdown,
    ShutdownHandler, StaticConfig, TransportBuilder,
};
pub use config::{ClientConfig, ServerConfig};
pub use control::{ControlChannel, PlayerCommand};
pub use error::{ClientError, Result};
pub use event::ClientEvent;
pub use iter::{ClientEventIterator, TryIterator};

pub use squeeze_comet::{ConnectionState, FailureKind, SessionConfig};
pub use squeeze_status::{logging, PlaybackMode, PlayerStatus};
