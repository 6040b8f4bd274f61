use squeeze_comet::CometError;
use thiserror::Error;

/// Errors that can occur in the squeeze client
#[derive(Error, Debug)]
pub enum ClientError {
    /// The background worker has stopped and no longer accepts commands
    #[error("Background worker is not running")]
    WorkerDisconnected,

    /// Invalid configuration provided
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A control request failed
    #[error("Control request failed: {0}")]
    Control(String),

    /// Error from the Bayeux session
    #[error("Session error: {0}")]
    Comet(#[from] CometError),

    /// The worker runtime could not be created
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl From<reqwest::Error> for ClientError {
    fn from(error: reqwest::Error) -> Self {
        ClientError::Control(error.to_string())
    }
}

/// Result type for client operations
pub type Result<T> = std::result::Result<T, ClientError>;
