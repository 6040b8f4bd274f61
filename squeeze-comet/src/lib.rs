//! # squeeze-comet
//!
//! Bayeux/CometD client plumbing for talking to a Lyrion/Squeezebox media server.
//!
//! The crate covers the subset of the protocol a control client needs:
//! handshake, long-poll connect, subscribe, publish, disconnect and
//! advice-driven reconnection.
//!
//! ## Architecture
//!
//! 1. **[`Session`]**: owns the [`ConnectionTracker`], the handshake policy and
//!    message ids. It is driven by a single task.
//! 2. **[`Transport`]**: [`RequestTransport`] sends one HTTP POST per batch;
//!    [`StreamingTransport`] keeps one raw HTTP/1.1 socket for the control
//!    channels and reads chunked responses on a background task.
//! 3. **[`ExchangeRegistry`]**: each transport's table of outstanding messages,
//!    with an expiry task per exchange.
//!
//! Background work never mutates session state. It posts an [`Inbound`] event
//! to the session queue and the owner applies it with [`Session::handle`].
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use squeeze_comet::{AlwaysReachable, Endpoint, HttpTransportFactory, Session, SessionConfig};
//!
//! let config = SessionConfig::default();
//! let endpoint = Endpoint::new("http://192.168.1.20:9000/cometd", &config.app_namespace)?;
//! let factory = HttpTransportFactory::new(endpoint, config.streaming_enabled);
//!
//! let (mut session, mut inbound) = Session::new(config, Arc::new(AlwaysReachable));
//! session.connect(&factory).await?;
//! while let Some(event) = inbound.recv().await {
//!     session.handle(event).await?;
//!     for event in session.take_events() {
//!         println!("{:?}", event);
//!     }
//! }
//! ```

pub mod config;
pub mod error;
pub mod link;
pub mod message;
pub mod registry;
pub mod session;
pub mod state;
pub mod transport;

pub use config::SessionConfig;
pub use error::{CometError, Result, TransportError};
pub use link::{Inbound, ReconnectAction, TransportKind, TransportLink};
pub use message::{channel, Advice, Message, MessageClass, MessageId, Reconnect};
pub use registry::{ChannelMatch, Delivery, Exchange, ExchangeRegistry, ExchangeTimeouts};
pub use session::{AlwaysReachable, ConnectivityProbe, Session, SessionEvent};
pub use state::{ConnectionState, ConnectionTracker, FailureKind, REHANDSHAKE_WINDOW};
pub use transport::{
    Endpoint, HttpTransportFactory, RequestTransport, StreamingTransport, Transport, TransportFactory,
};
