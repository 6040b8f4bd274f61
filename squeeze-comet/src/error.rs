//! Error types for the squeeze-comet crate.

use crate::message::MessageId;

/// Errors that can occur while driving a Bayeux session.
#[derive(Debug, thiserror::Error)]
pub enum CometError {
    /// An exchange is already registered for this message id
    #[error("Exchange already registered for message id {0}")]
    DuplicateExchange(MessageId),

    /// An outbound message was handed to the registry without an id
    #[error("Outbound message has no id")]
    MissingMessageId,

    /// The operation needs an established session
    #[error("Session is not connected")]
    NotConnected,

    /// No transport has been opened for this session yet
    #[error("No transport available")]
    NoTransport,

    /// A transport failed while sending
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// A message could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The configured server URL is unusable
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Invalid configuration provided
    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// Errors reported by a transport for a batch of outbound messages.
///
/// Cloneable because the same error is attached to every failed message of a
/// batch when failure replies are synthesized.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The connection could not be opened
    #[error("Connection failed: {0}")]
    Connect(String),

    /// An IO error on an open connection
    #[error("IO error: {0}")]
    Io(String),

    /// The server answered with a non-200 status
    #[error("Unexpected HTTP status {0}")]
    Status(u16),

    /// The server answered 200 with an empty body
    #[error("No content in response")]
    NoContent,

    /// The response could not be framed or parsed
    #[error("Framing error: {0}")]
    Framing(String),

    /// No reply arrived before the exchange expired
    #[error("Exchange timed out")]
    Timeout,

    /// The transport was aborted while the exchange was pending
    #[error("Transport aborted")]
    Aborted,

    /// The server closed the connection
    #[error("Connection closed by server")]
    Closed,
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof => TransportError::Closed,
            std::io::ErrorKind::ConnectionRefused => TransportError::Connect(err.to_string()),
            _ => TransportError::Io(err.to_string()),
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout
        } else if err.is_connect() {
            TransportError::Connect(err.to_string())
        } else if let Some(status) = err.status() {
            TransportError::Status(status.as_u16())
        } else {
            TransportError::Io(err.to_string())
        }
    }
}

/// Convenience type alias for Results using CometError.
pub type Result<T> = std::result::Result<T, CometError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_comet_error_display() {
        let error = CometError::DuplicateExchange(MessageId::from("7"));
        assert_eq!(error.to_string(), "Exchange already registered for message id 7");

        let error = CometError::NotConnected;
        assert_eq!(error.to_string(), "Session is not connected");

        let error = CometError::Transport(TransportError::NoContent);
        assert_eq!(error.to_string(), "Transport error: No content in response");
    }

    #[test]
    fn test_transport_error_display() {
        assert_eq!(TransportError::Status(503).to_string(), "Unexpected HTTP status 503");
        assert_eq!(TransportError::Aborted.to_string(), "Transport aborted");
        assert_eq!(
            TransportError::Framing("bad chunk size".to_string()).to_string(),
            "Framing error: bad chunk size"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let eof = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        assert_eq!(TransportError::from(eof), TransportError::Closed);

        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(matches!(TransportError::from(refused), TransportError::Connect(_)));
    }
}
