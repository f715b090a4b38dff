//! Error types for peerlink.

use std::time::Duration;

use thiserror::Error;

/// Main error type for all peerlink operations.
#[derive(Debug, Error)]
pub enum LinkError {
    /// Endpoint configuration violates an invariant.
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// `start_listening` called while a handshake or session is active.
    #[error("Already connecting")]
    AlreadyConnecting,

    /// No matching peer connected within the establishment timeout.
    #[error("Handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// No frame arrived within the receive timeout.
    #[error("Receive timed out after {0:?}")]
    ReceiveTimeout(Duration),

    /// Handshake superseded by an overwriting `start_listening`.
    #[error("Handshake cancelled")]
    Cancelled,

    /// Malformed frame received from the peer.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Peer closed the connection.
    #[error("Connection closed by peer")]
    PeerClosed,

    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame could not be encoded for the wire.
    #[error("Encode error: {0}")]
    Encode(String),

    /// Wire text could not be decoded into a frame.
    #[error("Decode error: {0}")]
    Decode(String),

    /// No route registered for the frame type.
    #[error("No route for frame type: {0}")]
    UnknownFrameType(String),

    /// JSON error (settings documents, typed payload conversion).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias using LinkError.
pub type Result<T> = std::result::Result<T, LinkError>;
