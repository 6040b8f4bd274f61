//! Events delivered to the host application.

use serde_json::Value;
use squeeze_comet::ConnectionState;
use squeeze_status::PlayerStatus;

use crate::control::PlayerCommand;

/// Something the UI should react to.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// A new status snapshot for a player, from a push or a status query
    Status(PlayerStatus),

    /// The session moved to a new connection state
    ConnectionState(ConnectionState),

    /// Outcome of a command sent with
    /// [`CometClient::publish`](crate::CometClient::publish)
    CommandResult {
        player: String,
        command: PlayerCommand,
        result: Result<Value, String>,
    },
}

impl ClientEvent {
    pub fn player(&self) -> Option<&str> {
        match self {
            ClientEvent::Status(status) => Some(&status.id),
            ClientEvent::CommandResult { player, .. } => Some(player),
            ClientEvent::ConnectionState(_) => None,
        }
    }
}
