//! Common error types for Freespeak.

use thiserror::Error;

use crate::protocol::ProtocolError;

/// Result type alias using Freespeak's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for Freespeak operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Malformed or oversized frame
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Transport could not be opened or was lost
    #[error("transport error: {0}")]
    Transport(String),
}

impl Error {
    /// Create a serialization error from any displayable type.
    pub fn serialization(msg: impl std::fmt::Display) -> Self {
        Self::Serialization(msg.to_string())
    }

    /// Create a transport error from any displayable type.
    pub fn transport(msg: impl std::fmt::Display) -> Self {
        Self::Transport(msg.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err)
    }
}
