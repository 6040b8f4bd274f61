//! Events flowing back into the session's queue.
//!
//! Transport tasks, the socket reader and session timers never touch session
//! state directly. They post an [`Inbound`] event tagged with the generation of
//! the connection cycle that produced it, and the owner of the session applies
//! it in queue order.

use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::message::{Message, MessageId};

/// Which transport strategy produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// One HTTP request per outbound batch
    Request,
    /// One persistent socket carrying the control channels
    Streaming,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Request => write!(f, "request"),
            TransportKind::Streaming => write!(f, "streaming"),
        }
    }
}

/// What a scheduled reconnection should do when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectAction {
    Handshake,
    Connect,
}

/// An event for the session queue.
#[derive(Debug)]
pub enum Inbound {
    /// Raw messages read from a transport, not yet correlated
    Received {
        generation: u64,
        transport: TransportKind,
        batch: Vec<Message>,
    },
    /// A request or connection failed
    Failed {
        generation: u64,
        transport: TransportKind,
        error: TransportError,
        batch: Vec<Message>,
    },
    /// An exchange's expiry timer fired
    Expired {
        generation: u64,
        transport: TransportKind,
        id: MessageId,
    },
    /// The handshake did not complete in time
    HandshakeTimeout { generation: u64 },
    /// A scheduled reconnection is due
    Reconnect {
        generation: u64,
        action: ReconnectAction,
    },
}

impl Inbound {
    pub fn generation(&self) -> u64 {
        match self {
            Inbound::Received { generation, .. }
            | Inbound::Failed { generation, .. }
            | Inbound::Expired { generation, .. }
            | Inbound::HandshakeTimeout { generation }
            | Inbound::Reconnect { generation, .. } => *generation,
        }
    }
}

/// Handle a transport uses to report back to the session queue.
#[derive(Debug, Clone)]
pub struct TransportLink {
    generation: u64,
    kind: TransportKind,
    tx: mpsc::UnboundedSender<Inbound>,
}

impl TransportLink {
    pub fn new(generation: u64, kind: TransportKind, tx: mpsc::UnboundedSender<Inbound>) -> Self {
        Self {
            generation,
            kind,
            tx,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn received(&self, batch: Vec<Message>) {
        self.post(Inbound::Received {
            generation: self.generation,
            transport: self.kind,
            batch,
        });
    }

    pub fn failed(&self, error: TransportError, batch: Vec<Message>) {
        self.post(Inbound::Failed {
            generation: self.generation,
            transport: self.kind,
            error,
            batch,
        });
    }

    pub fn expired(&self, id: MessageId) {
        self.post(Inbound::Expired {
            generation: self.generation,
            transport: self.kind,
            id,
        });
    }

    fn post(&self, event: Inbound) {
        if self.tx.send(event).is_err() {
            tracing::debug!(transport = %self.kind, "session queue closed, dropping transport event");
        }
    }
}
