//! Error types for pathsteer.

use std::io;

use thiserror::Error;

/// Result type alias for pathsteer operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for pathsteer.
#[derive(Error, Debug)]
pub enum Error {
    // Transport errors
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("connection closed")]
    ConnectionClosed,

    // Protocol errors
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    // Path errors
    #[error("no path to destination")]
    NoPath,

    #[error("path {0} not found")]
    PathNotFound(String),

    // Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // General errors
    #[error("internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Errors reported by the underlying path-aware transport.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("no path to {0}")]
    NoPathToDestination(String),

    #[error("write error: {0}")]
    WriteFailed(String),

    #[error("transport closed")]
    Closed,

    #[error("MTU exceeded: packet size {size}, max {max}")]
    MtuExceeded { size: usize, max: usize },
}

/// Wire format errors.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("unknown message marker")]
    UnknownMarker,

    #[error("malformed probe: expected {expected} id bytes, got {got}")]
    MalformedProbe { expected: usize, got: usize },

    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),
}

impl Error {
    /// Check if the error only affects the current cycle and the next scheduled
    /// attempt may succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::NoPath
                | Error::Transport(
                    TransportError::SendFailed(_)
                        | TransportError::NoPathToDestination(_)
                        | TransportError::WriteFailed(_)
                )
                | Error::Io(_)
        )
    }

    /// Check if the error means the owning connection is gone.
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            Error::ConnectionClosed | Error::Transport(TransportError::Closed)
        )
    }
}
