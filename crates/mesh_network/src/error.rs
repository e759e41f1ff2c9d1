//! Network error types.

use std::net::SocketAddr;
use std::time::Duration;

/// Errors that can occur in the mesh_network crate.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// The listening address could not be bound. Fatal at startup.
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The listener or connection was closed. Expected during shutdown.
    #[error("Closed")]
    Closed,

    /// A frame arrived whose body is not a valid message envelope.
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// A connection failed (dial, read, write or framing loss).
    #[error("Connection error: {0}")]
    Connection(String),

    /// Message construction was rejected.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// `start()` was called on a node that is not freshly created.
    #[error("Node already started")]
    AlreadyStarted,

    /// The node is not running.
    #[error("Node not running")]
    NotRunning,

    /// The requested peer was not found in the registry.
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// An operation timed out.
    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    /// JSON serialization / deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl NetworkError {
    /// Whether this error only signals an orderly close.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Whether the connection that produced this error is still usable.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::MalformedMessage(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(NetworkError::Closed.is_closed());
        assert!(!NetworkError::Closed.is_recoverable());
        assert!(NetworkError::MalformedMessage("bad kind".into()).is_recoverable());
        assert!(!NetworkError::Connection("reset".into()).is_recoverable());
    }

    #[test]
    fn test_bind_error_display() {
        let err = NetworkError::Bind {
            addr: "127.0.0.1:9470".parse().unwrap(),
            source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use"),
        };
        assert_eq!(err.to_string(), "Failed to bind 127.0.0.1:9470: in use");
    }
}
