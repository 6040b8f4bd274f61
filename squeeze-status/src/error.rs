//! Error types for squeeze-status

/// Result type for status decoding
pub type Result<T> = std::result::Result<T, StatusError>;

/// Errors that can occur while decoding a status payload
#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    /// The payload is not a JSON object
    #[error("Status payload is not an object")]
    NotAnObject,

    /// A field has a type that cannot be interpreted
    #[error("Invalid status payload: {0}")]
    Invalid(#[from] serde_json::Error),

    /// The server address used for artwork resolution is unusable
    #[error("Invalid server address: {0}")]
    InvalidServer(String),
}
